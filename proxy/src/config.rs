use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Listener {
    pub host: String,
    pub port: u16,
    pub paths: Paths,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
            paths: Paths::default(),
        }
    }
}

/// Endpoint paths. Setting one to null disables the endpoint.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Paths {
    pub flags: Option<String>,
    pub report: Option<String>,
    pub config: Option<String>,
    pub health: Option<String>,
    pub ready: Option<String>,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            flags: Some("/flags".into()),
            report: Some("/report".into()),
            config: Some("/config".into()),
            health: Some("/health".into()),
            ready: Some("/ready".into()),
        }
    }
}

impl Paths {
    /// Enabled paths, for validation.
    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        [
            &self.flags,
            &self.report,
            &self.config,
            &self.health,
            &self.ready,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
    }
}

/// Client authentication for `/flags`, `/report` and `/config`.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub client_api_keys: Vec<String>,
    pub reject_unauthorized: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            client_api_keys: Vec::new(),
            reject_unauthorized: true,
        }
    }
}

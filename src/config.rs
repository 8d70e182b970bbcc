/// Runtime-wide configuration. The registry and dispatcher themselves take
/// no external configuration; this exists for the demo binary and for
/// embedders that want to tune logging without reaching into `tracing`
/// directly.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

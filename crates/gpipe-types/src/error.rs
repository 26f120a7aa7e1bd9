// Workspace-wide error type for configuration and device handling.

#[derive(Debug, thiserror::Error)]
pub enum GPipeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("device error: {0}")]
    Device(String),
}

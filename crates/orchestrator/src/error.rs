use crate::state::{Command, SessionStatus};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot {command} while {from}")]
    InvalidTransition {
        from: SessionStatus,
        command: Command,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_status_and_command() {
        let err = Error::InvalidTransition {
            from: SessionStatus::Idle,
            command: Command::Pause,
        };
        assert_eq!(err.to_string(), "cannot pause while idle");
    }
}

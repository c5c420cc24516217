use tracing::warn;

pub const INITIAL_TRACK: &str = "........";

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid player position {0}")]
pub struct InvalidPosition(pub i64);

/// What the player sees: the track with the hero on it and a caption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionDisplay {
    pub track: String,
    pub message: String,
}

impl Default for PositionDisplay {
    fn default() -> Self {
        Self {
            track: INITIAL_TRACK.to_string(),
            message: String::new(),
        }
    }
}

impl PositionDisplay {
    pub fn update_player_position(&mut self, position: i64) -> Result<(), InvalidPosition> {
        let (track, message) = match position {
            0 => ("o........", "A journey begins..."),
            1 => ("....o....", ""),
            2 => ("......o..", ""),
            3 => (".........\\o/", "You have reached the end! Super!"),
            other => {
                warn!(position = other, "invalid player position");
                return Err(InvalidPosition(other));
            }
        };
        self.track = track.to_string();
        self.message = message.to_string();
        Ok(())
    }
}

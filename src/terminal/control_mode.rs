//! Control mode: a prefix byte sequence on the input path that diverts the
//! next keystroke to a daemon-level session-switch command instead of the
//! multiplexer. Off the happy path by default — most input passes straight
//! through untouched.
//!
//! Supplements the normal key-encoding input path (`keys.rs`); it does not
//! replace it.

/// Default prefix: Ctrl-B, matching the multiplexer's own convention so a
/// user's muscle memory carries over.
pub const DEFAULT_PREFIX: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    NextSession,
    PreviousSession,
    SwitchToIndex(u8),
    Detach,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Not control-mode input; send these bytes to the session as normal.
    PassThrough,
    /// The prefix byte was seen; waiting for the command byte.
    AwaitingCommand,
    /// A complete control command was recognized.
    Command(ControlCommand),
    /// The prefix was seen but the following byte wasn't a known command;
    /// drop it rather than forward a half-typed sequence to the multiplexer.
    UnknownCommand,
}

/// Tracks whether the last byte seen on a session's input path was the
/// control-mode prefix.
#[derive(Debug)]
pub struct ControlModeState {
    prefix: u8,
    awaiting_command: bool,
}

impl ControlModeState {
    pub fn new(prefix: u8) -> Self {
        Self { prefix, awaiting_command: false }
    }

    /// Feed one input byte, returning what should happen with it.
    pub fn feed(&mut self, byte: u8) -> ControlOutcome {
        if self.awaiting_command {
            self.awaiting_command = false;
            return match command_for(byte) {
                Some(command) => ControlOutcome::Command(command),
                None => ControlOutcome::UnknownCommand,
            };
        }

        if byte == self.prefix {
            self.awaiting_command = true;
            return ControlOutcome::AwaitingCommand;
        }

        ControlOutcome::PassThrough
    }
}

impl Default for ControlModeState {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

fn command_for(byte: u8) -> Option<ControlCommand> {
    match byte {
        b'n' => Some(ControlCommand::NextSession),
        b'p' => Some(ControlCommand::PreviousSession),
        b'd' => Some(ControlCommand::Detach),
        b'0'..=b'9' => Some(ControlCommand::SwitchToIndex(byte - b'0')),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_bytes_pass_through() {
        let mut state = ControlModeState::default();
        assert_eq!(state.feed(b'a'), ControlOutcome::PassThrough);
    }

    #[test]
    fn prefix_then_known_command_recognized() {
        let mut state = ControlModeState::default();
        assert_eq!(state.feed(DEFAULT_PREFIX), ControlOutcome::AwaitingCommand);
        assert_eq!(state.feed(b'n'), ControlOutcome::Command(ControlCommand::NextSession));
    }

    #[test]
    fn prefix_then_digit_switches_by_index() {
        let mut state = ControlModeState::default();
        state.feed(DEFAULT_PREFIX);
        assert_eq!(state.feed(b'3'), ControlOutcome::Command(ControlCommand::SwitchToIndex(3)));
    }

    #[test]
    fn prefix_then_unknown_byte_is_dropped_not_passed_through() {
        let mut state = ControlModeState::default();
        state.feed(DEFAULT_PREFIX);
        assert_eq!(state.feed(b'z'), ControlOutcome::UnknownCommand);
    }

    #[test]
    fn state_resets_after_a_command() {
        let mut state = ControlModeState::default();
        state.feed(DEFAULT_PREFIX);
        state.feed(b'n');
        assert_eq!(state.feed(b'x'), ControlOutcome::PassThrough);
    }
}

//! Splits raw stdin into keystrokes for the shell and local commands.
//!
//! Local commands start with the prefix key `Ctrl-]`:
//!
//! | after `Ctrl-]` | action |
//! |---|---|
//! | `1`..`9` | switch to the Nth shell in the catalog |
//! | `l` | list shells |
//! | `q` | quit |
//! | `Ctrl-]` | send a literal `Ctrl-]` |
//!
//! Any other key after the prefix is swallowed.

/// `Ctrl-]`
pub const PREFIX_KEY: u8 = 0x1d;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputAction {
    Forward(Vec<u8>),
    /// Zero-based catalog index.
    SwitchShell(usize),
    ListShells,
    Quit,
}

#[derive(Debug, Default)]
pub struct InputRouter {
    prefix_pending: bool,
}

impl InputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one chunk of input. A prefix at the end of a chunk carries over
    /// to the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<InputAction> {
        let mut actions = Vec::new();
        let mut forward = Vec::new();

        for &byte in bytes {
            if !self.prefix_pending {
                if byte == PREFIX_KEY {
                    self.prefix_pending = true;
                } else {
                    forward.push(byte);
                }
                continue;
            }

            self.prefix_pending = false;
            let command = match byte {
                PREFIX_KEY => {
                    forward.push(PREFIX_KEY);
                    continue;
                }
                b'1'..=b'9' => InputAction::SwitchShell(usize::from(byte - b'1')),
                b'l' | b'L' => InputAction::ListShells,
                b'q' | b'Q' => InputAction::Quit,
                _ => continue,
            };

            if !forward.is_empty() {
                actions.push(InputAction::Forward(std::mem::take(&mut forward)));
            }
            actions.push(command);
        }

        if !forward.is_empty() {
            actions.push(InputAction::Forward(forward));
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_input_forwarded() {
        let mut router = InputRouter::new();
        assert_eq!(
            router.feed(b"ls -la\r"),
            vec![InputAction::Forward(b"ls -la\r".to_vec())]
        );
        assert!(router.feed(b"").is_empty());
    }

    #[test]
    fn test_commands_split_forwarded_bytes() {
        let mut router = InputRouter::new();
        let actions = router.feed(b"ab\x1d2cd\x1dl\x1dq");
        assert_eq!(
            actions,
            vec![
                InputAction::Forward(b"ab".to_vec()),
                InputAction::SwitchShell(1),
                InputAction::Forward(b"cd".to_vec()),
                InputAction::ListShells,
                InputAction::Quit,
            ]
        );
    }

    #[test]
    fn test_double_prefix_sends_literal() {
        let mut router = InputRouter::new();
        assert_eq!(
            router.feed(b"x\x1d\x1dy"),
            vec![InputAction::Forward(vec![b'x', PREFIX_KEY, b'y'])]
        );
    }

    #[test]
    fn test_prefix_carries_across_chunks() {
        let mut router = InputRouter::new();
        assert_eq!(router.feed(b"echo\x1d"), vec![InputAction::Forward(b"echo".to_vec())]);
        assert_eq!(router.feed(b"9"), vec![InputAction::SwitchShell(8)]);
        assert_eq!(router.feed(b"9"), vec![InputAction::Forward(b"9".to_vec())]);
    }

    #[test]
    fn test_unknown_command_swallowed() {
        let mut router = InputRouter::new();
        assert_eq!(router.feed(b"\x1dz\x1d0ok"), vec![InputAction::Forward(b"ok".to_vec())]);
    }
}

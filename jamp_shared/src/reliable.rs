//! Reliable string commands.
//!
//! The sender keeps every command in a ring of `MAX_RELIABLE_COMMANDS` and
//! resends all unacknowledged ones in each packet. The receiver executes them
//! strictly in sequence, skipping duplicates. Both ends use the same types:
//! the server for server commands and the client for client commands.

use thiserror::Error;

use crate::limits::{MAX_RELIABLE_COMMANDS, MAX_STRING_CHARS};
use crate::net::ReliableCommand;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("reliable command overflow")]
    Overflow,
    #[error("acknowledge went backwards ({acknowledged} < {previous})")]
    AckRegressed { acknowledged: i32, previous: i32 },
    #[error("acknowledge {acknowledged} is beyond the last sent command {sent}")]
    AckAhead { acknowledged: i32, sent: i32 },
    #[error("command of {0} bytes is too long")]
    CommandTooLong(usize),
    #[error("lost reliable commands (expected {expected}, got {got})")]
    LostCommands { expected: i32, got: i32 },
}

/// Outgoing side: commands waiting for acknowledgement.
#[derive(Debug, Clone)]
pub struct ReliableCommands {
    ring: Vec<String>,
    sequence: i32,
    acknowledge: i32,
}

impl Default for ReliableCommands {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableCommands {
    pub fn new() -> Self {
        Self {
            ring: vec![String::new(); MAX_RELIABLE_COMMANDS],
            sequence: 0,
            acknowledge: 0,
        }
    }

    /// Restarts both counters at `sequence` (used when a gamestate resets the
    /// stream).
    pub fn reset(&mut self, sequence: i32) {
        self.sequence = sequence;
        self.acknowledge = sequence;
        self.ring.iter_mut().for_each(String::clear);
    }

    /// Sequence of the last command added.
    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    /// Last sequence the peer acknowledged.
    pub fn acknowledged(&self) -> i32 {
        self.acknowledge
    }

    pub fn outstanding(&self) -> usize {
        (self.sequence - self.acknowledge) as usize
    }

    /// Appends a command, returning its sequence. A full ring is an error:
    /// the peer has to be dropped rather than lose a command.
    pub fn push(&mut self, text: &str) -> Result<i32, ChannelError> {
        if text.len() >= MAX_STRING_CHARS {
            return Err(ChannelError::CommandTooLong(text.len()));
        }
        if self.outstanding() >= MAX_RELIABLE_COMMANDS {
            return Err(ChannelError::Overflow);
        }
        self.sequence += 1;
        let slot = self.sequence as usize % MAX_RELIABLE_COMMANDS;
        self.ring[slot] = text.to_string();
        Ok(self.sequence)
    }

    /// Retires everything up to `ack`. The acknowledgement may only move
    /// forward and never past what was sent.
    pub fn acknowledge(&mut self, ack: i32) -> Result<(), ChannelError> {
        if ack < self.acknowledge {
            return Err(ChannelError::AckRegressed {
                acknowledged: ack,
                previous: self.acknowledge,
            });
        }
        if ack > self.sequence {
            return Err(ChannelError::AckAhead {
                acknowledged: ack,
                sent: self.sequence,
            });
        }
        self.acknowledge = ack;
        Ok(())
    }

    /// Unacknowledged commands, oldest first.
    pub fn pending(&self) -> Vec<ReliableCommand> {
        (self.acknowledge + 1..=self.sequence)
            .map(|sequence| ReliableCommand {
                sequence,
                text: self.ring[sequence as usize % MAX_RELIABLE_COMMANDS].clone(),
            })
            .collect()
    }

    pub fn get(&self, sequence: i32) -> Option<&str> {
        if sequence <= self.acknowledge || sequence > self.sequence {
            return None;
        }
        Some(&self.ring[sequence as usize % MAX_RELIABLE_COMMANDS])
    }
}

/// Incoming side: the last command executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandWindow {
    last: i32,
}

impl CommandWindow {
    pub fn new(last: i32) -> Self {
        Self { last }
    }

    pub fn last(&self) -> i32 {
        self.last
    }

    /// Returns whether `sequence` is the next command to execute. Already
    /// executed sequences yield `Ok(false)`; a gap is an error.
    pub fn accept(&mut self, sequence: i32) -> Result<bool, ChannelError> {
        if sequence <= self.last {
            return Ok(false);
        }
        if sequence > self.last + 1 {
            return Err(ChannelError::LostCommands {
                expected: self.last + 1,
                got: sequence,
            });
        }
        self.last = sequence;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_increase_and_acks_retire() {
        let mut r = ReliableCommands::new();
        let seqs: Vec<i32> = ["print a", "print b", "cs 3 x"].iter().map(|c| r.push(c).unwrap()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        r.acknowledge(2).unwrap();
        let pending = r.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence, 3);
        assert_eq!(pending[0].text, "cs 3 x");
        assert_eq!(r.get(2), None);
    }

    #[test]
    fn bad_acknowledgements_are_errors() {
        let mut r = ReliableCommands::new();
        r.push("a").unwrap();
        r.push("b").unwrap();
        r.acknowledge(2).unwrap();
        assert_eq!(
            r.acknowledge(1),
            Err(ChannelError::AckRegressed {
                acknowledged: 1,
                previous: 2
            })
        );
        assert_eq!(r.acknowledge(5), Err(ChannelError::AckAhead { acknowledged: 5, sent: 2 }));
        assert_eq!(r.acknowledged(), 2);
    }

    #[test]
    fn overflow_instead_of_losing_commands() {
        let mut r = ReliableCommands::new();
        for i in 0..MAX_RELIABLE_COMMANDS {
            r.push(&format!("print {i}")).unwrap();
        }
        assert_eq!(r.push("one more"), Err(ChannelError::Overflow));
        assert_eq!(r.pending().first().map(|c| c.text.as_str()), Some("print 0"));

        r.acknowledge(1).unwrap();
        assert!(r.push("one more").is_ok());
        assert_eq!(r.push(&"x".repeat(MAX_STRING_CHARS)), Err(ChannelError::CommandTooLong(MAX_STRING_CHARS)));
    }

    #[test]
    fn window_skips_duplicates_and_rejects_gaps() {
        let mut w = CommandWindow::default();
        assert_eq!(w.accept(1), Ok(true));
        assert_eq!(w.accept(1), Ok(false));
        assert_eq!(w.accept(2), Ok(true));
        assert_eq!(w.accept(4), Err(ChannelError::LostCommands { expected: 3, got: 4 }));
        assert_eq!(w.last(), 2);
    }
}

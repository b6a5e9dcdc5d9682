//! Outbound adapter seams.
//!
//! Songbirds (messaging platforms) and flowerbeds (HTTP static content)
//! consume leaves off the wind and push them out of the forest. Their
//! concrete implementations live outside the core; these traits are the
//! contract an embedding application implements and wires to wind
//! subscriptions itself.

use anyhow::Result;
use nimsforest_types::Leaf;

/// An outbound messaging adapter (Telegram, Slack, ...).
pub trait Songbird: Send {
    fn name(&self) -> &str;
    /// Deliver one leaf to the platform.
    fn sing(&mut self, leaf: &Leaf) -> Result<()>;
}

/// An outbound static-content adapter (rendered pages, feeds).
pub trait Flowerbed: Send {
    fn name(&self) -> &str;
    /// Re-render content for one leaf.
    fn bloom(&mut self, leaf: &Leaf) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSongbird {
        name: String,
        delivered: Vec<String>,
    }

    impl Songbird for RecordingSongbird {
        fn name(&self) -> &str {
            &self.name
        }
        fn sing(&mut self, leaf: &Leaf) -> Result<()> {
            self.delivered.push(leaf.subject.clone());
            Ok(())
        }
    }

    #[test]
    fn songbird_receives_leaves() {
        let mut bird = RecordingSongbird {
            name: "telegram".to_string(),
            delivered: Vec::new(),
        };
        bird.sing(&Leaf::new("song.telegram.1", b"{}".to_vec(), "nim:router"))
            .expect("sing");
        assert_eq!(bird.delivered, vec!["song.telegram.1"]);
        assert_eq!(bird.name(), "telegram");
    }
}

//! Notices emitted by the SDK for the presentation layer to show.

use std::fmt;

use crate::types::ItemId;

/// User-visible notifications (toasts, status lines, bot replies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Our own vote was counted and broadcast.
    VoteConfirmed {
        item: ItemId,
    },

    /// A single item took the lead.
    Leader {
        item: ItemId,
    },

    /// Two or more items share the lead.
    Tie {
        items: Vec<ItemId>,
    },

    /// A new random battle replaced the current one.
    RandomBattle {
        items: Vec<ItemId>,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::VoteConfirmed { .. } => {
                write!(f, "Thanks for voting! Watch the results update in real time.")
            }
            Notice::Leader { item } => {
                write!(f, "We have a winner! #{item} is leading the battle!")
            }
            Notice::Tie { .. } => write!(f, "It's a tie! The battle is heating up!"),
            Notice::RandomBattle { .. } => write!(f, "New random battle started!"),
        }
    }
}

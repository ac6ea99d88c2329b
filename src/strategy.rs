//! Placement strategies: which free block satisfies a request.

use core::fmt;
use core::str::FromStr;

use crate::blocklist::{Block, BlockList};

/// The policy a [`Pool`](../allocators/struct.Pool.html) uses to pick a free
/// block for a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// The first free block large enough, scanning from the head.
    FirstFit,
    /// The smallest free block large enough. Ties go to the earliest.
    BestFit,
    /// The largest free block large enough. Ties go to the earliest.
    WorstFit,
    /// The first free block large enough at or after the block chosen by the
    /// previous next-fit search. Blocks before that cursor are never
    /// revisited.
    NextFit,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::FirstFit
    }
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::FirstFit,
        Strategy::BestFit,
        Strategy::WorstFit,
        Strategy::NextFit,
    ];

    /// Pick a free block of at least `size` bytes, or `None` if nothing
    /// qualifies. The list is not modified.
    ///
    /// `cursor` is only consulted by `NextFit`, and must be a member of
    /// `blocks` when given.
    pub fn select(self, blocks: &BlockList, size: usize, cursor: Option<Block>) -> Option<Block> {
        let found = match self {
            Strategy::FirstFit => blocks.iter().find(|b| b.fits(size)),
            Strategy::BestFit => blocks
                .iter()
                .filter(|b| b.fits(size))
                .fold(None, |best: Option<Block>, block| match best {
                    Some(b) if b.size() <= block.size() => Some(b),
                    _ => Some(block),
                }),
            Strategy::WorstFit => blocks
                .iter()
                .filter(|b| b.fits(size))
                .fold(None, |widest: Option<Block>, block| match widest {
                    Some(w) if w.size() >= block.size() => Some(w),
                    _ => Some(block),
                }),
            Strategy::NextFit => blocks
                .iter_from(cursor.or_else(|| blocks.head()))
                .find(|b| b.fits(size)),
        };

        log::trace!("{} for {} bytes: {:?}", self, size, found);
        found
    }

    fn name(self) -> &'static str {
        match self {
            Strategy::FirstFit => "first-fit",
            Strategy::BestFit => "best-fit",
            Strategy::WorstFit => "worst-fit",
            Strategy::NextFit => "next-fit",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a string names no known strategy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ParseStrategyError;

impl fmt::Display for ParseStrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected one of: first, best, worst, next")
    }
}

impl FromStr for Strategy {
    type Err = ParseStrategyError;

    /// Accepts `first`, `first-fit`, `first_fit` or `firstfit` (and so on for
    /// the others), in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let stem = ["-fit", "_fit", "fit"]
            .iter()
            .find_map(|suffix| {
                let cut = s.len().checked_sub(suffix.len())?;
                let tail = s.get(cut..)?;
                if tail.eq_ignore_ascii_case(suffix) {
                    s.get(..cut)
                } else {
                    None
                }
            })
            .unwrap_or(s);

        Strategy::ALL
            .iter()
            .copied()
            .find(|strategy| {
                let name = strategy.name();
                stem.eq_ignore_ascii_case(&name[..name.len() - "-fit".len()])
            })
            .ok_or(ParseStrategyError)
    }
}

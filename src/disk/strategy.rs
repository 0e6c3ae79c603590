use crate::disk::volume::Volume;
use crate::error::{BlobberError, Result};

/// Picks a volume for new allocation data.
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select<'a>(&self, volumes: &'a [Volume]) -> Option<&'a Volume>;
}

/// Built-in strategy registered as `min_size_first`.
///
/// Despite its name it picks the volume with the most available space. The name is kept
/// for configuration compatibility.
pub struct MinSizeFirst;

impl SelectionStrategy for MinSizeFirst {
    fn name(&self) -> &'static str {
        "min_size_first"
    }

    fn select<'a>(&self, volumes: &'a [Volume]) -> Option<&'a Volume> {
        // First volume wins ties so the choice is stable across calls.
        volumes.iter().fold(None, |best: Option<&Volume>, v| match best {
            Some(b) if b.available_size >= v.available_size => Some(b),
            _ => Some(v),
        })
    }
}

pub fn strategy_by_name(name: &str) -> Result<Box<dyn SelectionStrategy>> {
    match name {
        "min_size_first" => Ok(Box::new(MinSizeFirst)),
        other => Err(BlobberError::Config(format!(
            "unknown volume selection strategy {}",
            other
        ))),
    }
}

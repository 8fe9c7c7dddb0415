//! Extraction callback contract
//!
//! An extractor turns one seed into a lazy stream of [`Yield`]s. The worker
//! consumes the stream to exhaustion and only then decides the outcome of the
//! attempt.

use crate::state::{Item, Seed};

/// One value produced by an extractor
#[derive(Debug, Clone, PartialEq)]
pub enum Yield {
    /// A record for one of the configured destinations
    Item(Item),

    /// A new seed to schedule
    FollowUp(Seed),

    /// Several new seeds to schedule
    FollowUps(Vec<Seed>),

    /// Explicit outcome of the attempt; the last one yielded wins
    Outcome(bool),
}

impl From<Item> for Yield {
    fn from(item: Item) -> Self {
        Self::Item(item)
    }
}

impl From<Seed> for Yield {
    fn from(seed: Seed) -> Self {
        Self::FollowUp(seed)
    }
}

impl From<Vec<Seed>> for Yield {
    fn from(seeds: Vec<Seed>) -> Self {
        Self::FollowUps(seeds)
    }
}

impl From<bool> for Yield {
    fn from(outcome: bool) -> Self {
        Self::Outcome(outcome)
    }
}

impl From<String> for Yield {
    fn from(payload: String) -> Self {
        Self::FollowUp(Seed::new(payload))
    }
}

impl From<&str> for Yield {
    fn from(payload: &str) -> Self {
        Self::FollowUp(Seed::new(payload))
    }
}

/// Lazy stream of yields for one attempt
pub type Extraction<'a> = Box<dyn Iterator<Item = anyhow::Result<Yield>> + 'a>;

/// User-supplied extraction logic
///
/// An `Err` element (or a panic) fails the attempt and schedules a retry.
/// Closures taking `&Seed` and returning any owned iterable of
/// `anyhow::Result<Yield>` implement this trait.
pub trait Extractor: Send + Sync {
    fn extract<'a>(&'a self, seed: &'a Seed) -> Extraction<'a>;
}

impl<F, I> Extractor for F
where
    F: Fn(&Seed) -> I + Send + Sync,
    I: IntoIterator<Item = anyhow::Result<Yield>>,
    I::IntoIter: 'static,
{
    fn extract<'a>(&'a self, seed: &'a Seed) -> Extraction<'a> {
        Box::new(self(seed).into_iter())
    }
}

/// Emits the seed payload itself as a single item, then succeeds
///
/// Payloads that parse as JSON are stored as that JSON value; anything else
/// is stored as a string.
#[derive(Debug, Clone)]
pub struct Passthrough {
    destination: String,
}

impl Passthrough {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
        }
    }
}

impl Extractor for Passthrough {
    fn extract<'a>(&'a self, seed: &'a Seed) -> Extraction<'a> {
        let record = serde_json::from_str(&seed.payload)
            .unwrap_or_else(|_| serde_json::Value::String(seed.payload.clone()));
        let item = Item::new(self.destination.clone(), record);
        Box::new([Ok(Yield::Item(item)), Ok(Yield::Outcome(true))].into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_yield_conversions() {
        assert_eq!(Yield::from(true), Yield::Outcome(true));
        assert_eq!(Yield::from("next"), Yield::FollowUp(Seed::new("next")));
        assert_eq!(
            Yield::from(String::from("next")),
            Yield::FollowUp(Seed::new("next"))
        );
        assert_eq!(
            Yield::from(vec![Seed::new("a"), Seed::new("b")]),
            Yield::FollowUps(vec![Seed::new("a"), Seed::new("b")])
        );

        let item = Item::new("articles", json!(1));
        assert_eq!(Yield::from(item.clone()), Yield::Item(item));
    }

    #[test]
    fn test_closure_extractor() {
        let extractor = |seed: &Seed| -> Vec<anyhow::Result<Yield>> {
            vec![
                Ok(Yield::from(format!("{}/next", seed.payload))),
                Ok(Yield::from(true)),
            ]
        };

        let seed = Seed::new("a");
        let yields: Vec<Yield> = extractor
            .extract(&seed)
            .collect::<anyhow::Result<_>>()
            .unwrap();

        assert_eq!(
            yields,
            vec![Yield::FollowUp(Seed::new("a/next")), Yield::Outcome(true)]
        );
    }

    #[test]
    fn test_passthrough_parses_json_payloads() {
        let extractor = Passthrough::new("articles");

        let seed = Seed::new(r#"{"id": 7}"#);
        let yields: Vec<Yield> = extractor.extract(&seed).map(Result::unwrap).collect();
        assert_eq!(
            yields,
            vec![
                Yield::Item(Item::new("articles", json!({"id": 7}))),
                Yield::Outcome(true),
            ]
        );

        let seed = Seed::new("https://example.com/");
        let first = extractor.extract(&seed).next().unwrap().unwrap();
        assert_eq!(
            first,
            Yield::Item(Item::new("articles", json!("https://example.com/")))
        );
    }
}

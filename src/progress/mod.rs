//! Progress collaborator
//!
//! Records which lessons a student has completed and decides which lessons
//! they may attempt. Recording is idempotent: completing a lesson twice
//! leaves the same state as completing it once.

pub mod memory;
pub mod redis_tracker;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryProgress;
pub use redis_tracker::RedisProgressTracker;

/// Durable record of completed lessons
#[async_trait]
pub trait ProgressTracker: Send + Sync {
    /// Mark a lesson completed for a user; safe to repeat
    async fn record_completion(&self, user_id: &str, lesson_id: u32) -> Result<()>;

    /// All lessons the user has completed
    async fn completed_lessons(&self, user_id: &str) -> Result<BTreeSet<u32>>;
}

/// Which lessons a student may attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonGate {
    /// Every lesson is open
    #[default]
    Open,
    /// Lesson N needs lesson N-1 completed
    Sequential,
    /// Lesson N needs any earlier lesson completed
    AnyCompleted,
}

impl LessonGate {
    /// The first lesson and already-completed lessons are always accessible
    pub fn is_accessible(
        &self,
        lesson_id: u32,
        first_lesson_id: Option<u32>,
        completed: &BTreeSet<u32>,
    ) -> bool {
        if first_lesson_id == Some(lesson_id) || completed.contains(&lesson_id) {
            return true;
        }

        match self {
            LessonGate::Open => true,
            LessonGate::Sequential => lesson_id
                .checked_sub(1)
                .is_some_and(|previous| completed.contains(&previous)),
            LessonGate::AnyCompleted => completed.range(..lesson_id).next().is_some(),
        }
    }
}

impl FromStr for LessonGate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "none" => Ok(LessonGate::Open),
            "sequential" => Ok(LessonGate::Sequential),
            "any_completed" | "any" => Ok(LessonGate::AnyCompleted),
            other => anyhow::bail!(
                "Unknown lesson gating '{}' (expected open, sequential or any_completed)",
                other
            ),
        }
    }
}

impl fmt::Display for LessonGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LessonGate::Open => "open",
            LessonGate::Sequential => "sequential",
            LessonGate::AnyCompleted => "any_completed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(days: &[u32]) -> BTreeSet<u32> {
        days.iter().copied().collect()
    }

    #[test]
    fn test_open_gate() {
        assert!(LessonGate::Open.is_accessible(7, Some(1), &completed(&[])));
    }

    #[test]
    fn test_sequential_gate() {
        let gate = LessonGate::Sequential;
        assert!(gate.is_accessible(1, Some(1), &completed(&[])));
        assert!(!gate.is_accessible(2, Some(1), &completed(&[])));
        assert!(gate.is_accessible(2, Some(1), &completed(&[1])));
        assert!(!gate.is_accessible(4, Some(1), &completed(&[1, 2])));
        // Revisiting a completed lesson stays allowed.
        assert!(gate.is_accessible(2, Some(1), &completed(&[2])));
        assert!(!gate.is_accessible(0, Some(1), &completed(&[])));
    }

    #[test]
    fn test_any_completed_gate() {
        let gate = LessonGate::AnyCompleted;
        assert!(!gate.is_accessible(5, Some(1), &completed(&[])));
        assert!(gate.is_accessible(5, Some(1), &completed(&[2])));
        assert!(!gate.is_accessible(5, Some(1), &completed(&[6])));
    }

    #[test]
    fn test_parse_gate() {
        assert_eq!("open".parse::<LessonGate>().unwrap(), LessonGate::Open);
        assert_eq!(
            " Sequential ".parse::<LessonGate>().unwrap(),
            LessonGate::Sequential
        );
        assert_eq!(
            "any_completed".parse::<LessonGate>().unwrap(),
            LessonGate::AnyCompleted
        );
        assert!("strict".parse::<LessonGate>().is_err());
        assert_eq!(LessonGate::AnyCompleted.to_string(), "any_completed");
    }
}

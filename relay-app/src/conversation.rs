//! Process-wide conversation buffer shared by every client.
//!
//! Lives for the process lifetime and is never persisted. Each mutation takes
//! the lock briefly; concurrent requests may interleave their turns in the
//! order their upstream calls complete.

use relay_llm::{Turn, clamp_tail};
use std::collections::VecDeque;
use tokio::sync::Mutex;

pub struct ConversationStore {
    turns: Mutex<VecDeque<Turn>>,
    max_turns: usize,
    max_message_chars: usize,
}

impl ConversationStore {
    pub fn new(max_turns: usize, max_message_chars: usize) -> Self {
        Self {
            turns: Mutex::new(VecDeque::with_capacity(max_turns.saturating_add(1))),
            max_turns,
            max_message_chars,
        }
    }

    pub fn max_message_chars(&self) -> usize {
        self.max_message_chars
    }

    /// Appends `turn` (text clamped to the cap) and trims to the newest turns.
    pub async fn append(&self, turn: Turn) {
        let mut turns = self.turns.lock().await;
        self.push_trimmed(&mut turns, turn);
    }

    /// Appends each turn unless it equals the current last turn. Returns how
    /// many were appended.
    pub async fn merge(&self, incoming: Vec<Turn>) -> usize {
        let mut turns = self.turns.lock().await;
        let mut appended = 0;
        for turn in incoming {
            if turns.back() == Some(&turn) {
                continue;
            }
            self.push_trimmed(&mut turns, turn);
            appended += 1;
        }
        appended
    }

    /// Appends and returns the trimmed contents in one critical section, so
    /// the snapshot always ends with `turn`.
    pub async fn append_and_snapshot(&self, turn: Turn) -> Vec<Turn> {
        let mut turns = self.turns.lock().await;
        self.push_trimmed(&mut turns, turn);
        turns.iter().cloned().collect()
    }

    pub async fn snapshot(&self) -> Vec<Turn> {
        self.turns.lock().await.iter().cloned().collect()
    }

    pub async fn turn_count(&self) -> usize {
        self.turns.lock().await.len()
    }

    fn push_trimmed(&self, turns: &mut VecDeque<Turn>, mut turn: Turn) {
        turn.text = clamp_tail(&turn.text, self.max_message_chars);
        turns.push_back(turn);
        while turns.len() > self.max_turns {
            turns.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trims_to_the_most_recent_turns() {
        let store = ConversationStore::new(4, 100);
        for i in 0..6 {
            store.append(Turn::user(format!("m{i}"))).await;
        }
        let texts: Vec<String> = store.snapshot().await.into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4", "m5"]);
    }

    #[tokio::test]
    async fn appended_text_is_clamped_to_its_tail() {
        let store = ConversationStore::new(4, 5);
        store.append(Turn::assistant("0123456789")).await;
        assert_eq!(store.snapshot().await, vec![Turn::assistant("56789")]);
    }

    #[tokio::test]
    async fn merge_skips_entries_equal_to_the_last_turn() {
        let store = ConversationStore::new(10, 100);
        store.append(Turn::user("hi")).await;

        let appended = store
            .merge(vec![Turn::user("hi"), Turn::assistant("hello")])
            .await;
        assert_eq!(appended, 1);

        let appended = store.merge(vec![Turn::assistant("hello")]).await;
        assert_eq!(appended, 0);
        assert_eq!(
            store.snapshot().await,
            vec![Turn::user("hi"), Turn::assistant("hello")]
        );
    }

    #[tokio::test]
    async fn merge_only_dedups_against_the_last_turn() {
        let store = ConversationStore::new(10, 100);
        store
            .merge(vec![Turn::user("a"), Turn::assistant("b"), Turn::user("a")])
            .await;
        assert_eq!(store.turn_count().await, 3);

        // Same text, different role is a different turn.
        store.merge(vec![Turn::assistant("a")]).await;
        assert_eq!(store.turn_count().await, 4);
    }

    #[tokio::test]
    async fn snapshot_after_append_ends_with_the_new_turn() {
        let store = ConversationStore::new(2, 100);
        store.append(Turn::user("one")).await;
        store.append(Turn::assistant("two")).await;
        let snapshot = store.append_and_snapshot(Turn::user("three")).await;
        assert_eq!(snapshot, vec![Turn::assistant("two"), Turn::user("three")]);
    }
}

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long a block keeps its appearance signal before reverting.
pub const DEFAULT_HOLD: Duration = Duration::from_millis(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSignal {
    Idle,
    JustAppeared,
}

#[derive(Debug)]
struct BlockState {
    appeared_at: Option<Instant>,
    has_appeared: bool,
}

/// Decides when a text block should visually signal "new content" as
/// opposed to "existing content updated". Keyed by a stable identity
/// (thought slot key or insight id), never by the text itself: the
/// signal fires exactly once per identity, on the first non-empty
/// text, and incremental growth never re-fires it.
///
/// Time is injected so callers (and tests) control the clock.
#[derive(Debug)]
pub struct TextPresenter {
    blocks: HashMap<String, BlockState>,
    hold: Duration,
}

impl Default for TextPresenter {
    fn default() -> Self {
        Self::new(DEFAULT_HOLD)
    }
}

impl TextPresenter {
    pub fn new(hold: Duration) -> Self {
        Self {
            blocks: HashMap::new(),
            hold,
        }
    }

    /// Feeds the current text for an identity and returns the signal
    /// the renderer should apply right now.
    pub fn observe(&mut self, key: &str, text: &str, now: Instant) -> BlockSignal {
        let state = self.blocks.entry(key.to_string()).or_insert(BlockState {
            appeared_at: None,
            has_appeared: false,
        });
        if !state.has_appeared && !text.is_empty() {
            state.has_appeared = true;
            state.appeared_at = Some(now);
        }
        Self::signal_of(state, now, self.hold)
    }

    /// Current signal without feeding new text (renderers polling
    /// between events).
    pub fn signal(&self, key: &str, now: Instant) -> BlockSignal {
        self.blocks
            .get(key)
            .map(|state| Self::signal_of(state, now, self.hold))
            .unwrap_or(BlockSignal::Idle)
    }

    /// Drops expired appearance windows. Purely a memory tidy-up;
    /// `signal` already reports Idle for expired blocks.
    pub fn tick(&mut self, now: Instant) {
        let hold = self.hold;
        for state in self.blocks.values_mut() {
            if let Some(at) = state.appeared_at {
                if now.duration_since(at) >= hold {
                    state.appeared_at = None;
                }
            }
        }
    }

    /// Forgets identities no longer on screen.
    pub fn retain<F: Fn(&str) -> bool>(&mut self, keep: F) {
        self.blocks.retain(|key, _| keep(key));
    }

    fn signal_of(state: &BlockState, now: Instant, hold: Duration) -> BlockSignal {
        match state.appeared_at {
            Some(at) if now.duration_since(at) < hold => BlockSignal::JustAppeared,
            _ => BlockSignal::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appearance_fires_once_per_identity() {
        let mut presenter = TextPresenter::new(Duration::from_millis(500));
        let start = Instant::now();

        assert_eq!(
            presenter.observe("thought-0", "a", start),
            BlockSignal::JustAppeared
        );
        // Growth under the same identity never re-triggers.
        let later = start + Duration::from_secs(2);
        assert_eq!(presenter.observe("thought-0", "ab", later), BlockSignal::Idle);
        assert_eq!(
            presenter.observe("thought-0", "abc", later),
            BlockSignal::Idle
        );
    }

    #[test]
    fn empty_text_does_not_arm_the_signal() {
        let mut presenter = TextPresenter::default();
        let start = Instant::now();
        assert_eq!(presenter.observe("slot", "", start), BlockSignal::Idle);
        // First non-empty text is the appearance.
        assert_eq!(
            presenter.observe("slot", "hello", start),
            BlockSignal::JustAppeared
        );
    }

    #[test]
    fn signal_reverts_after_hold() {
        let mut presenter = TextPresenter::new(Duration::from_millis(100));
        let start = Instant::now();
        presenter.observe("id", "text", start);

        let within = start + Duration::from_millis(50);
        assert_eq!(presenter.signal("id", within), BlockSignal::JustAppeared);

        let after = start + Duration::from_millis(150);
        assert_eq!(presenter.signal("id", after), BlockSignal::Idle);

        presenter.tick(after);
        assert_eq!(presenter.signal("id", after), BlockSignal::Idle);
    }

    #[test]
    fn identities_are_independent() {
        let mut presenter = TextPresenter::new(Duration::from_millis(500));
        let start = Instant::now();
        presenter.observe("a", "first", start);
        let later = start + Duration::from_secs(1);
        assert_eq!(
            presenter.observe("b", "second", later),
            BlockSignal::JustAppeared
        );
        assert_eq!(presenter.signal("a", later), BlockSignal::Idle);
    }
}

/// Predicate over the token ids generated so far (prompt excluded).
pub trait StopCriterion: Send + Sync {
    fn should_stop(&self, generated: &[u32]) -> bool;
}

impl<F> StopCriterion for F
where
    F: Fn(&[u32]) -> bool + Send + Sync,
{
    fn should_stop(&self, generated: &[u32]) -> bool {
        self(generated)
    }
}

/// Matches when the generated ids end with any of the stop words.
#[derive(Debug, Clone, Default)]
pub struct StopWordsCriterion {
    stop_words: Vec<Vec<u32>>,
}

impl StopWordsCriterion {
    /// Empty stop words are dropped, they would match everything.
    pub fn new(stop_words: Vec<Vec<u32>>) -> Self {
        Self {
            stop_words: stop_words.into_iter().filter(|w| !w.is_empty()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stop_words.is_empty()
    }
}

impl StopCriterion for StopWordsCriterion {
    fn should_stop(&self, generated: &[u32]) -> bool {
        self.stop_words
            .iter()
            .any(|word| generated.ends_with(word))
    }
}

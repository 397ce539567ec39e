use dialflow_core::types::{Answer, AnswerKey, Answers, ExtractionInput, PathId};
use serde_json::Value;

/// Committed answers for guard tests.
pub fn answers(pairs: &[(&str, Value)]) -> Answers {
    let mut answers = Answers::new();
    for (key, value) in pairs {
        answers.insert(
            AnswerKey::new(*key),
            Answer {
                value: value.clone(),
                turn: 0,
                confidence: 1.0,
            },
        );
    }
    answers
}

/// A scripted sequence of extractor outputs.
#[derive(Debug, Clone, Default)]
pub struct TurnScript {
    turns: Vec<ExtractionInput>,
}

impl TurnScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn(mut self, input: ExtractionInput) -> Self {
        self.turns.push(input);
        self
    }

    /// A turn carrying a single answer.
    pub fn answer(self, key: &str, value: Value) -> Self {
        self.turn(ExtractionInput::new().answer(key, value))
    }

    /// A turn carrying only a path signal.
    pub fn signal(self, path: &str) -> Self {
        self.turn(ExtractionInput::new().path(PathId::new(path)))
    }

    /// One path-signal turn per entry.
    pub fn signals(self, paths: &[&str]) -> Self {
        paths.iter().fold(self, |script, path| script.signal(path))
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtractionInput> {
        self.turns.iter()
    }

    pub fn into_turns(self) -> Vec<ExtractionInput> {
        self.turns
    }
}

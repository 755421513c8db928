//! Shared state for the game routes.
//!
//! Each game is optional; routes of a missing game answer 503.

use std::sync::Arc;

use crate::mnist::DigitGame;
use crate::projection::WordProjector;
use crate::steering::KnobGame;

use super::dto::GamesDto;

/// Cloned into every handler; the games themselves are shared.
#[derive(Clone, Default)]
pub struct AppState {
    digit: Option<Arc<DigitGame>>,
    words: Option<Arc<WordProjector>>,
    knobs: Option<Arc<KnobGame>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_digit_game(mut self, game: DigitGame) -> Self {
        self.digit = Some(Arc::new(game));
        self
    }

    pub fn with_word_projector(mut self, projector: WordProjector) -> Self {
        self.words = Some(Arc::new(projector));
        self
    }

    pub fn with_knob_game(mut self, game: KnobGame) -> Self {
        self.knobs = Some(Arc::new(game));
        self
    }

    pub fn digit_game(&self) -> Option<Arc<DigitGame>> {
        self.digit.clone()
    }

    pub fn word_projector(&self) -> Option<Arc<WordProjector>> {
        self.words.clone()
    }

    pub fn knob_game(&self) -> Option<Arc<KnobGame>> {
        self.knobs.clone()
    }

    pub fn games(&self) -> GamesDto {
        GamesDto {
            digit: self.digit.is_some(),
            coordinates: self.words.is_some(),
            steer: self.knobs.is_some(),
        }
    }
}

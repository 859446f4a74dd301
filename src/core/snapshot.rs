//! Read-only accessors over a cached game payload
//!
//! Payloads are stored in the shape pushed over the live connection:
//!
//! ```text
//! {
//!   "game":   { "game": {round_no, dealer, seating, scores_total},
//!               "phase": {"phase": "Bidding", "data": {round, to_act, bids, ...}} },
//!   "viewer": { "seat": 2, "hand": ["AS", ...], "bidConstraints": ... } | null
//! }
//! ```
//!
//! The engine never interprets game rules; it only needs to know whose turn
//! it is and where a few fields live so it can make speculative edits.

use serde_json::Value;

/// Seat index at the table (0..=3)
pub type Seat = u8;

/// Round phase as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Bidding,
    TrumpSelect,
    Trick,
    Scoring,
    Complete,
    GameOver,
}

impl Phase {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "Init" => Phase::Init,
            "Bidding" => Phase::Bidding,
            "TrumpSelect" => Phase::TrumpSelect,
            "Trick" => Phase::Trick,
            "Scoring" => Phase::Scoring,
            "Complete" => Phase::Complete,
            "GameOver" => Phase::GameOver,
            _ => return None,
        })
    }

    /// Phases in which a single seat is expected to act
    pub fn awaits_player(&self) -> bool {
        matches!(self, Phase::Bidding | Phase::TrumpSelect | Phase::Trick)
    }
}

/// Borrowed view of a `{game, viewer}` payload
#[derive(Debug, Clone, Copy)]
pub struct GameView<'a> {
    payload: &'a Value,
}

impl<'a> GameView<'a> {
    pub fn new(payload: &'a Value) -> Self {
        Self { payload }
    }

    pub fn phase(&self) -> Option<Phase> {
        self.payload
            .pointer("/game/phase/phase")
            .and_then(Value::as_str)
            .and_then(Phase::parse)
    }

    /// Seat expected to act, when the phase has one
    pub fn to_act(&self) -> Option<Seat> {
        self.payload
            .pointer("/game/phase/data/to_act")
            .and_then(as_seat)
    }

    /// Seat of the viewer, when the payload was rendered for a player
    pub fn viewer_seat(&self) -> Option<Seat> {
        self.payload.pointer("/viewer/seat").and_then(as_seat)
    }

    pub fn has_viewer(&self) -> bool {
        self.payload.get("viewer").is_some_and(|v| !v.is_null())
    }

    /// Whether `seat` is the one expected to act
    pub fn is_turn_of(&self, seat: Seat) -> bool {
        self.phase().is_some_and(|p| p.awaits_player()) && self.to_act() == Some(seat)
    }
}

fn as_seat(value: &Value) -> Option<Seat> {
    value.as_u64().and_then(|n| Seat::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(phase: &str, to_act: u8, seat: Option<u8>) -> Value {
        json!({
            "game": {
                "game": {"round_no": 3, "dealer": 0},
                "phase": {"phase": phase, "data": {"to_act": to_act}}
            },
            "viewer": seat.map(|s| json!({"seat": s, "hand": []}))
        })
    }

    #[test]
    fn test_turn_requires_an_acting_phase() {
        let bidding = payload("Bidding", 2, Some(2));
        let view = GameView::new(&bidding);
        assert_eq!(view.phase(), Some(Phase::Bidding));
        assert_eq!(view.viewer_seat(), Some(2));
        assert!(view.is_turn_of(2));
        assert!(!view.is_turn_of(1));

        let scoring = payload("Scoring", 2, Some(2));
        assert!(!GameView::new(&scoring).is_turn_of(2));
    }

    #[test]
    fn test_missing_fields() {
        let spectator = payload("Trick", 1, None);
        let view = GameView::new(&spectator);
        assert!(!view.has_viewer());
        assert_eq!(view.viewer_seat(), None);

        let empty = json!({});
        let view = GameView::new(&empty);
        assert_eq!(view.phase(), None);
        assert_eq!(view.to_act(), None);
    }

    #[test]
    fn test_unit_phases_have_no_data() {
        let over = json!({"game": {"phase": {"phase": "GameOver"}}, "viewer": null});
        let view = GameView::new(&over);
        assert_eq!(view.phase(), Some(Phase::GameOver));
        assert_eq!(view.to_act(), None);
    }
}

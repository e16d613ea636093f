// =============================================================================
// Shared types used across the Meridian trader fleet
// =============================================================================

use serde::{Deserialize, Serialize};

/// Margin mode applied per symbol before opening a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl Default for MarginMode {
    fn default() -> Self {
        Self::Cross
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cross => write!(f, "cross"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

/// Direction of an order sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// What the model asked us to do for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    OpenLong,
    OpenShort,
    Close,
    Hold,
    Wait,
}

impl ActionKind {
    /// Actions that do not touch the exchange.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Hold | Self::Wait)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenLong => write!(f, "open_long"),
            Self::OpenShort => write!(f, "open_short"),
            Self::Close => write!(f, "close"),
            Self::Hold => write!(f, "hold"),
            Self::Wait => write!(f, "wait"),
        }
    }
}

/// How entry orders are submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStrategy {
    Market,
    Limit,
}

impl Default for OrderStrategy {
    fn default() -> Self {
        Self::Market
    }
}

impl std::fmt::Display for OrderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_wire_format_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&ActionKind::OpenLong).unwrap(),
            "\"open_long\""
        );
        let parsed: ActionKind = serde_json::from_str("\"open_short\"").unwrap();
        assert_eq!(parsed, ActionKind::OpenShort);
    }

    #[test]
    fn noop_actions() {
        assert!(ActionKind::Hold.is_noop());
        assert!(ActionKind::Wait.is_noop());
        assert!(!ActionKind::Close.is_noop());
        assert!(!ActionKind::OpenLong.is_noop());
    }

    #[test]
    fn margin_mode_roundtrip() {
        let m: MarginMode = serde_json::from_str("\"isolated\"").unwrap();
        assert_eq!(m, MarginMode::Isolated);
        assert_eq!(serde_json::to_string(&MarginMode::Cross).unwrap(), "\"cross\"");
    }
}

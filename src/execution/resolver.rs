//! Reconciles a fused signal with the current position.

use crate::types::{Action, Position, SecurityId, Signal};

/// Decide what to do for `security_id` given a signal and the latest
/// position snapshot. Without a position the signal is passed through.
pub fn resolve(signal: Signal, security_id: SecurityId, positions: &[Position]) -> Action {
    let net = positions
        .iter()
        .find(|p| p.security_id == security_id)
        .map(|p| p.net_qty);

    match (signal, net) {
        (Signal::Hold, _) => Action::Hold,
        (Signal::Buy, None) | (Signal::Buy, Some(0)) => Action::Buy,
        (Signal::Sell, None) | (Signal::Sell, Some(0)) => Action::Sell,
        (Signal::Buy, Some(n)) if n < 0 => Action::Exit,
        (Signal::Sell, Some(n)) if n > 0 => Action::Exit,
        // already positioned in the signal's direction
        (Signal::Buy, Some(_)) | (Signal::Sell, Some(_)) => Action::Hold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(security_id: SecurityId, net_qty: i64) -> Position {
        Position {
            security_id,
            net_qty,
            avg_traded_price: 100.0,
            last_traded_price: 100.0,
            product: "I".to_string(),
        }
    }

    #[test]
    fn test_no_position_mirrors_signal() {
        assert_eq!(resolve(Signal::Buy, 1, &[]), Action::Buy);
        assert_eq!(resolve(Signal::Sell, 1, &[]), Action::Sell);
        assert_eq!(resolve(Signal::Hold, 1, &[]), Action::Hold);
        // someone else's position does not count
        assert_eq!(resolve(Signal::Buy, 1, &[position(2, -5)]), Action::Buy);
    }

    #[test]
    fn test_resolution_table() {
        let cases = [
            (Signal::Buy, -3, Action::Exit),
            (Signal::Buy, 0, Action::Buy),
            (Signal::Buy, 3, Action::Hold),
            (Signal::Sell, 3, Action::Exit),
            (Signal::Sell, 0, Action::Sell),
            (Signal::Sell, -3, Action::Hold),
            (Signal::Hold, -3, Action::Hold),
            (Signal::Hold, 0, Action::Hold),
            (Signal::Hold, 3, Action::Hold),
        ];
        for (signal, net, expected) in cases {
            let positions = vec![position(7, net)];
            assert_eq!(resolve(signal, 7, &positions), expected, "{signal} with net {net}");
        }
    }
}

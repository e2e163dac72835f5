//! Payout split arithmetic (spec §4.7 step 1, §9 "floating-point payouts are
//! avoided").
//!
//! `house_edge` is the one place a fraction enters the calculation; it is
//! applied once, floored to an integer number of base units, and every other
//! quantity is then derived by plain integer subtraction so the conservation
//! invariant (`winner_payout + loser_refund + house_share + tx_fee == pot`)
//! holds exactly, not just within rounding tolerance.

use duel_ids::EntityId;

/// The computed distribution of one match's pot (spec §8 "Conservation").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayoutSplit {
    /// Total pot, `2 * bet`.
    pub pot: u64,
    /// Amount retained by the operator.
    pub house_share: u64,
    /// Flat settlement fee actually charged, already subtracted from
    /// `player_one_amount` / `player_two_amount`. Capped so
    /// `house_share + tx_fee` never exceeds `pot` (see [`compute_split`]).
    pub tx_fee: u64,
    /// Amount paid to player one (zero unless player one won or it was a draw).
    pub player_one_amount: u64,
    /// Amount paid to player two (zero unless player two won or it was a draw).
    pub player_two_amount: u64,
}

/// Computes the payout split for a settled match.
///
/// - Decisive result: the winner receives `pot - house_share - tx_fee`, the loser gets nothing.
/// - Draw (`winner` is `None`): the remainder (after house share and fee)
///   splits evenly, with any odd unit from integer division going to player
///   one, per spec §9(c) ("draws refund both minus a house share").
///
/// `house_share` is floored first and capped at `pot`; `tx_fee` is then
/// capped at whatever remains of the pot. This keeps the conservation
/// invariant (`player_one_amount + player_two_amount + house_share + tx_fee
/// == pot`) an equality for every input, including a misconfigured
/// `house_edge` near `1.0` combined with a large flat fee — `MatchConfig::validate`
/// additionally rejects such configurations before they reach here, but
/// `compute_split` does not trust that as its only guard.
#[must_use]
pub fn compute_split(
    bet: u64,
    house_edge: f64,
    tx_fee: u64,
    winner: Option<EntityId>,
    player_one: EntityId,
    player_two: EntityId,
) -> PayoutSplit {
    let pot = bet.saturating_mul(2);
    let house_share = house_share_for(pot, house_edge);
    let tx_fee = tx_fee.min(pot.saturating_sub(house_share));
    let remainder = pot.saturating_sub(house_share).saturating_sub(tx_fee);

    let (player_one_amount, player_two_amount) = match winner {
        Some(winner) if winner == player_one => (remainder, 0),
        Some(winner) if winner == player_two => (0, remainder),
        _ => {
            let half = remainder / 2;
            let odd_unit = remainder % 2;
            (half + odd_unit, half)
        }
    };

    PayoutSplit { pot, house_share, tx_fee, player_one_amount, player_two_amount }
}

fn house_share_for(pot: u64, house_edge: f64) -> u64 {
    let share = (pot as f64) * house_edge.clamp(0.0, 1.0);
    (share.floor() as u64).min(pot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisive_winner_receives_pot_minus_house_share() {
        let p1 = EntityId(1);
        let p2 = EntityId(2);
        let split = compute_split(1_000, 0.05, 0, Some(p1), p1, p2);
        assert_eq!(split.pot, 2_000);
        assert_eq!(split.house_share, 100);
        assert_eq!(split.player_one_amount, 1_900);
        assert_eq!(split.player_two_amount, 0);
    }

    #[test]
    fn draw_splits_remainder_evenly() {
        let p1 = EntityId(1);
        let p2 = EntityId(2);
        let split = compute_split(1_000, 0.05, 0, None, p1, p2);
        assert_eq!(split.player_one_amount + split.player_two_amount, split.pot - split.house_share);
        assert!(split.player_one_amount.abs_diff(split.player_two_amount) <= 1);
    }

    #[test]
    fn conservation_holds_with_tx_fee() {
        let p1 = EntityId(1);
        let p2 = EntityId(2);
        let tx_fee = 7;
        let split = compute_split(777, 0.1, tx_fee, Some(p2), p1, p2);
        let accounted = split.player_one_amount + split.player_two_amount + split.house_share + split.tx_fee;
        assert_eq!(accounted, split.pot);
    }

    #[test]
    fn zero_house_edge_pays_out_the_whole_pot() {
        let p1 = EntityId(1);
        let p2 = EntityId(2);
        let split = compute_split(500, 0.0, 0, Some(p1), p1, p2);
        assert_eq!(split.house_share, 0);
        assert_eq!(split.player_one_amount, 1_000);
    }

    proptest::proptest! {
        /// Conservation (spec §8): for any bet, house edge, fee, and outcome,
        /// `player_one_amount + player_two_amount + house_share + tx_fee`
        /// equals the pot exactly, not just within rounding tolerance.
        ///
        /// `tx_fee` is bounded by `bet` (rather than drawn unboundedly) so the
        /// case is representative of real configuration — a fee larger than
        /// the pot itself is a `MatchConfig` validation failure, not something
        /// `compute_split` is asked to reconcile.
        #[test]
        fn player_amounts_plus_house_share_plus_fee_equal_the_pot(
            bet in 1u64..=1_000_000,
            house_edge in 0.0f64..=1.0,
            tx_fee in 0u64..=1_000_000,
            winner_is_player_one in proptest::option::of(proptest::bool::ANY),
        ) {
            let p1 = EntityId(1);
            let p2 = EntityId(2);
            let tx_fee = tx_fee.min(bet);
            let winner = winner_is_player_one.map(|is_p1| if is_p1 { p1 } else { p2 });
            let split = compute_split(bet, house_edge, tx_fee, winner, p1, p2);
            let accounted = split.player_one_amount + split.player_two_amount + split.house_share + split.tx_fee;
            prop_assert_eq!(accounted, split.pot);
        }
    }
}

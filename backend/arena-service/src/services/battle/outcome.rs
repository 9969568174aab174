use crate::config::BattleConfig;
use crate::models::{Battle, BattleResult, BattleVotes, RewardSplit};

/// Result of a battle from its final tallies
///
/// `margin_pct` is the winning side's share of all votes, rounded to one
/// decimal, so it ranges over [50, 100]; an empty battle is a tie at 0.
pub fn decide(battle: &Battle, config: &BattleConfig) -> BattleResult {
    let BattleVotes {
        challenger,
        defender,
        total,
    } = battle.votes;

    let margin_pct = if total > 0 {
        let share = challenger.max(defender) as f64 / total as f64 * 100.0;
        (share * 10.0).round() / 10.0
    } else {
        0.0
    };

    if challenger == defender {
        return BattleResult {
            winner: None,
            tie: true,
            margin_pct,
            reward: RewardSplit {
                winner: config.tie_points,
                loser: config.tie_points,
            },
        };
    }

    let winner = if challenger > defender {
        Some(battle.challenger.user_id)
    } else {
        battle.defender.as_ref().map(|d| d.user_id)
    };

    BattleResult {
        winner,
        tie: false,
        margin_pct,
        reward: RewardSplit {
            winner: config.winner_points,
            loser: config.loser_points,
        },
    }
}

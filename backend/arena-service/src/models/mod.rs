pub mod battle;
pub mod feed;
pub mod vote;

pub use battle::{
    Battle, BattleListCursor, BattlePage, BattleResult, BattleSide, BattleStatus, BattleTimeline,
    BattleVotes, RewardSplit,
};
pub use feed::{
    CounterDelta, CreatorStats, EngagementCounters, FeedItem, FeedPage, FeedRequest, Impression,
    ImpressionEvent, Item, ItemKind, ItemOrder, ItemQuery, NewItem, RankedItem, ScoreEntry,
    ScoreFactors, Tab, TabScores, ViewerContext,
};
pub use vote::{Vote, VoteAttempt, VoteReceipt, VoteSide, VoteSignal, VoterSignals};

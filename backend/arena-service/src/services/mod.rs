pub mod battle;
pub mod cursor;
pub mod diversity;
pub mod effects;
pub mod feed;
pub mod ranking;
pub mod scheduler;
pub mod votes;

pub use battle::BattleService;
pub use diversity::DiversityLayer;
pub use effects::SideEffects;
pub use feed::FeedFacade;
pub use ranking::RankingEngine;
pub use scheduler::{TransitionHandler, TransitionScheduler};
pub use votes::VoteLedger;

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::config::VoteConfig;
use crate::models::VoteAttempt;

#[derive(Default)]
struct IpActivity<'a> {
    submissions: usize,
    fingerprints: HashSet<&'a str>,
    users: HashSet<Uuid>,
}

/// Ballot-stuffing heuristic over one window of vote attempts
///
/// Flags when a single IP hash submitted more than `max_votes_per_ip` votes,
/// carried more than `max_fingerprints_per_ip` fingerprints, or more than
/// `max_users_per_ip` authenticated users. Rejected duplicates count too.
pub fn evaluate(attempts: &[VoteAttempt], config: &VoteConfig) -> Option<String> {
    let mut by_ip: HashMap<&str, IpActivity<'_>> = HashMap::new();

    for attempt in attempts {
        let Some(ip) = attempt.signals.ip_hash.as_deref() else {
            continue;
        };
        let activity = by_ip.entry(ip).or_default();
        activity.submissions += 1;
        if let Some(fingerprint) = attempt.signals.fingerprint.as_deref() {
            activity.fingerprints.insert(fingerprint);
        }
        if let Some(user_id) = attempt.signals.user_id {
            activity.users.insert(user_id);
        }
    }

    let mut reasons: Vec<String> = by_ip
        .into_iter()
        .filter_map(|(ip, activity)| {
            let short_ip: String = ip.chars().take(12).collect();
            if activity.submissions > config.max_votes_per_ip {
                Some(format!(
                    "ip {} submitted {} votes within {}s",
                    short_ip, activity.submissions, config.abuse_window_secs
                ))
            } else if activity.fingerprints.len() > config.max_fingerprints_per_ip {
                Some(format!(
                    "ip {} used {} fingerprints within {}s",
                    short_ip,
                    activity.fingerprints.len(),
                    config.abuse_window_secs
                ))
            } else if activity.users.len() > config.max_users_per_ip {
                Some(format!(
                    "ip {} carried {} accounts within {}s",
                    short_ip,
                    activity.users.len(),
                    config.abuse_window_secs
                ))
            } else {
                None
            }
        })
        .collect();

    reasons.sort();
    reasons.into_iter().next()
}

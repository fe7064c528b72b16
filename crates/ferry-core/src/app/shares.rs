//! Transfer-share quotas.
//!
//! Once per pass (and again before the pending pass) the global staging limit
//! is split between the shares that want to stage. Privileged shares get
//! their configured quota first; the unprivileged ones split what is left.

use std::collections::{BTreeMap, HashMap};

use crate::config::{LimitsConfig, SharesConfig};

use super::counters::SchedulerCounters;

/// Quotas of one direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectionQuota {
    per_share: HashMap<String, u32>,
    /// Allotment for an unprivileged share that had no demand when the
    /// quotas were computed.
    fallback: u32,
}

impl DirectionQuota {
    pub fn limit(&self, share: &str) -> u32 {
        self.per_share.get(share).copied().unwrap_or(self.fallback)
    }
}

/// Result of one computation. `None` limits mean unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareQuotas {
    preparing: Option<DirectionQuota>,
    finishing: Option<DirectionQuota>,
}

impl ShareQuotas {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn preparing_limit(&self, share: &str) -> Option<u32> {
        self.preparing.as_ref().map(|q| q.limit(share))
    }

    pub fn finishing_limit(&self, share: &str) -> Option<u32> {
        self.finishing.as_ref().map(|q| q.limit(share))
    }
}

#[derive(Debug, Clone)]
pub struct TransferShareAccountant {
    /// Global staging limit; 0 means unlimited.
    max_processing: u32,
    /// Ceiling of one unprivileged share.
    ceiling: u32,
    limited: BTreeMap<String, u32>,
}

impl TransferShareAccountant {
    pub fn new(max_processing: u32, max_per_share: u32, limited: BTreeMap<String, u32>) -> Self {
        let ceiling = match max_per_share {
            0 => max_processing,
            n => n,
        };
        Self {
            max_processing,
            ceiling,
            limited,
        }
    }

    pub fn from_config(limits: &LimitsConfig, shares: &SharesConfig) -> Self {
        Self::new(
            limits.max_processing,
            shares.max_per_share,
            shares.limited_shares.clone(),
        )
    }

    pub fn compute(&self, counters: &SchedulerCounters) -> ShareQuotas {
        if self.max_processing == 0 {
            return ShareQuotas::unlimited();
        }
        let reserved: u32 = self.limited.values().sum();
        let remaining = self.max_processing.saturating_sub(reserved);

        let preparing = self.unprivileged(counters.preparing_demand());
        let finishing = self.unprivileged(counters.finishing_demand());

        let mut prep_allot = self.allotment(preparing.len() as u32, remaining);
        let mut fin_allot = self.allotment(finishing.len() as u32, remaining);

        // both directions crowding the capacity: neither may take it all
        let prep_demand: u32 = preparing.iter().map(|(_, n)| n).sum();
        let fin_demand: u32 = finishing.iter().map(|(_, n)| n).sum();
        let half = remaining / 2;
        if prep_demand > half && fin_demand > half {
            prep_allot = (prep_allot / 2).max(1);
            fin_allot = (fin_allot / 2).max(1);
        }

        tracing::debug!(
            remaining,
            preparing_shares = preparing.len(),
            finishing_shares = finishing.len(),
            prep_allot,
            fin_allot,
            "share quotas computed"
        );

        ShareQuotas {
            preparing: Some(self.direction(&preparing, prep_allot, remaining)),
            finishing: Some(self.direction(&finishing, fin_allot, remaining)),
        }
    }

    fn unprivileged<'a>(
        &self,
        demand: impl Iterator<Item = (&'a str, u32)>,
    ) -> Vec<(&'a str, u32)> {
        demand
            .filter(|(share, _)| !self.limited.contains_key(*share))
            .collect()
    }

    fn allotment(&self, shares: u32, remaining: u32) -> u32 {
        if shares == 0 {
            return self.ceiling.min(remaining).max(1);
        }
        if shares.saturating_mul(self.ceiling) <= remaining {
            self.ceiling
        } else {
            (remaining / shares).max(1)
        }
    }

    fn direction(&self, demand: &[(&str, u32)], allot: u32, remaining: u32) -> DirectionQuota {
        let mut per_share: HashMap<String, u32> = demand
            .iter()
            .map(|(share, _)| (share.to_string(), allot))
            .collect();
        for (share, quota) in &self.limited {
            per_share.insert(share.clone(), *quota);
        }
        let fallback = self.allotment(demand.len() as u32 + 1, remaining);
        DirectionQuota {
            per_share,
            fallback,
        }
    }
}

//! Batch planning
//!
//! Groups the directly read registers of a device into the fewest range reads
//! per (bank, tier). A plan is computed once per configuration and reused by
//! every tick.

use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::register::{Bank, PollTier, RegisterDescriptor};

/// Modbus FC03/FC04 limit on registers per request.
pub const DEFAULT_MAX_SPAN: u16 = 125;

/// Unused words worth reading to avoid a second transaction.
pub const DEFAULT_MERGE_GAP: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerSettings {
    /// Largest number of words in one request.
    pub max_span: u16,
    /// Largest run of unused words that is still merged into an open batch.
    pub merge_gap: u16,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            max_span: DEFAULT_MAX_SPAN,
            merge_gap: DEFAULT_MERGE_GAP,
        }
    }
}

/// One range read covering one or more registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub bank: Bank,
    pub start: u16,
    pub span: u16,
    pub members: Vec<Member>,
}

/// A register inside a batch, with its address so decoding can find its words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub address: u16,
}

impl Batch {
    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    tiers: BTreeMap<PollTier, Vec<Batch>>,
}

impl BatchPlan {
    /// Batches of one tier, read-only bank first, ascending address.
    pub fn tier(&self, tier: PollTier) -> &[Batch] {
        self.tiers.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tiers that have at least one batch.
    pub fn tiers(&self) -> impl Iterator<Item = PollTier> + '_ {
        self.tiers
            .iter()
            .filter(|(_, batches)| !batches.is_empty())
            .map(|(tier, _)| *tier)
    }

    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.tiers.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.tiers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reject directly read registers whose address ranges intersect within a bank.
pub fn validate_layout(registers: &[RegisterDescriptor]) -> Result<(), ConfigError> {
    let mut ranges: Vec<(Bank, u32, u32, &str)> = registers
        .iter()
        .filter_map(|r| {
            r.address_range()
                .map(|(bank, start, end)| (bank, start, end, r.name.as_str()))
        })
        .collect();
    ranges.sort_unstable_by_key(|&(bank, start, end, _)| (bank, start, end));
    for pair in ranges.windows(2) {
        let (bank_a, _, end_a, name_a) = pair[0];
        let (bank_b, start_b, _, name_b) = pair[1];
        if bank_a == bank_b && start_b < end_a {
            return Err(ConfigError::Overlap {
                first: name_a.to_string(),
                second: name_b.to_string(),
                bank: bank_a,
            });
        }
    }
    Ok(())
}

/// Build the batch plan for a device's registers.
pub fn plan(
    registers: &[RegisterDescriptor],
    settings: PlannerSettings,
) -> Result<BatchPlan, ConfigError> {
    validate_layout(registers)?;
    let mut groups: BTreeMap<(PollTier, Bank), Vec<(u32, u32, &str)>> = BTreeMap::new();
    for register in registers {
        if let Some((bank, start, end)) = register.address_range() {
            groups
                .entry((register.tier, bank))
                .or_default()
                .push((start, end, register.name.as_str()));
        }
    }

    let mut tiers: BTreeMap<PollTier, Vec<Batch>> = BTreeMap::new();
    for ((tier, bank), mut members) in groups {
        members.sort_unstable_by_key(|&(start, _, _)| start);
        tiers
            .entry(tier)
            .or_default()
            .extend(merge_ranges(bank, &members, settings));
    }
    Ok(BatchPlan { tiers })
}

fn merge_ranges(bank: Bank, sorted: &[(u32, u32, &str)], settings: PlannerSettings) -> Vec<Batch> {
    let max_span = u32::from(settings.max_span.max(1));
    let merge_gap = u32::from(settings.merge_gap);
    let mut batches = Vec::new();
    let mut open: Option<(u32, u32, Vec<Member>)> = None;

    for &(start, end, name) in sorted {
        let member = Member {
            name: name.to_string(),
            address: start as u16,
        };
        if let Some((open_start, open_end, members)) = open.as_mut() {
            let gap = start.saturating_sub(*open_end);
            if gap <= merge_gap && end - *open_start <= max_span {
                *open_end = (*open_end).max(end);
                members.push(member);
                continue;
            }
        }
        if let Some(closed) = open.take() {
            batches.push(close(bank, closed));
        }
        open = Some((start, end, vec![member]));
    }
    if let Some(closed) = open.take() {
        batches.push(close(bank, closed));
    }
    batches
}

fn close(bank: Bank, (start, end, members): (u32, u32, Vec<Member>)) -> Batch {
    Batch {
        bank,
        start: start as u16,
        span: (end - start).min(u32::from(u16::MAX)) as u16,
        members,
    }
}

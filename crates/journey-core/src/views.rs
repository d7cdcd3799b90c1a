//! Derived views: pure functions over playbook and stored records
//!
//! Nothing here writes. Missing data yields zeros, never errors, and every
//! function is linear in the number of instances it inspects.

use crate::api::{AttachmentTally, ScoreboardEntry};
use crate::store::Tables;
use crate::types::{Attachment, AttachmentStatus, NodeInstance, NodeState, ProjectionRow, UserId};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use journey_playbook::{NodeId, Playbook, PlaybookVersionId, TenantId, WorldId};
use std::collections::{BTreeMap, HashSet};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Scoreboard points per completed node outside the optional world
pub const POINTS_PER_NODE: u32 = 100;

/// Scoreboard entries shown before the caller's own row
pub const SCOREBOARD_TOP: usize = 5;

/// Instances of one student bound to one playbook version
#[must_use]
pub fn instances_in_version(
    tables: &Tables,
    tenant: TenantId,
    student: UserId,
    version: PlaybookVersionId,
) -> Vec<&NodeInstance> {
    tables
        .instances_of(tenant, student)
        .filter(|i| i.playbook_version_id == version)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
}

/// Done nodes over counted nodes. The optional world is left out of both
/// sides when the student's profile does not require it.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn progress(playbook: &Playbook, instances: &[&NodeInstance], rp_required: bool) -> Progress {
    let excluded: HashSet<&NodeId> = match playbook.optional_world() {
        Some(world) if !rp_required => playbook.nodes_in_world(world).iter().collect(),
        _ => HashSet::new(),
    };
    let total = playbook.node_count().saturating_sub(excluded.len());
    let completed = instances
        .iter()
        .filter(|i| i.state == NodeState::Done)
        .filter(|i| playbook.contains(&i.node_id) && !excluded.contains(&i.node_id))
        .count();
    let percent = (completed as f64 / total.max(1) as f64 * 100.0).min(100.0);
    Progress {
        completed,
        total,
        percent,
    }
}

/// World of the most recently updated instance not yet done, else the
/// first world
#[must_use]
pub fn current_stage(playbook: &Playbook, instances: &[&NodeInstance]) -> Option<WorldId> {
    instances
        .iter()
        .filter(|i| i.state != NodeState::Done)
        .max_by_key(|i| (i.updated_at, i.instance_id))
        .and_then(|i| playbook.world_of(&i.node_id))
        .or_else(|| playbook.first_world())
        .cloned()
}

/// Node with the most pending instances updated since `since`; ties go to
/// the smallest node id
pub fn bottleneck<'a>(
    instances: impl IntoIterator<Item = &'a NodeInstance>,
    since: DateTime<Utc>,
) -> Option<(NodeId, usize)> {
    let mut counts: BTreeMap<&NodeId, usize> = BTreeMap::new();
    for instance in instances {
        if instance.state.is_pending() && instance.updated_at >= since {
            *counts.entry(&instance.node_id).or_default() += 1;
        }
    }
    let mut best: Option<(&NodeId, usize)> = None;
    for (node, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((node, count));
        }
    }
    best.map(|(node, count)| (node.clone(), count))
}

/// Days between the first opening and the last update of a student's done
/// instances in `world`; `None` when there are none
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn stage_duration_days(
    playbook: &Playbook,
    world: &WorldId,
    instances: &[&NodeInstance],
) -> Option<f64> {
    let mut done = instances
        .iter()
        .filter(|i| i.state == NodeState::Done && playbook.world_of(&i.node_id) == Some(world));
    let first = done.next()?;
    let (opened, updated) = done.fold((first.opened_at, first.updated_at), |(o, u), i| {
        (o.min(i.opened_at), u.max(i.updated_at))
    });
    Some((updated - opened).num_milliseconds() as f64 / MILLIS_PER_DAY)
}

/// Order-statistic median, averaging the middle pair; 0.0 when empty
#[must_use]
pub fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

pub fn tally<'a>(attachments: impl IntoIterator<Item = &'a Attachment>) -> AttachmentTally {
    let mut tally = AttachmentTally::default();
    for attachment in attachments {
        tally.total += 1;
        match attachment.status {
            AttachmentStatus::Submitted => tally.submitted += 1,
            AttachmentStatus::UnderReview => tally.under_review += 1,
            AttachmentStatus::Approved | AttachmentStatus::ApprovedWithComments => {
                tally.approved += 1;
            }
            AttachmentStatus::Rejected => tally.rejected += 1,
        }
    }
    tally
}

/// Points earned by one student's projection rows
pub fn score<'a>(playbook: &Playbook, rows: impl IntoIterator<Item = &'a ProjectionRow>) -> u32 {
    let optional = playbook.optional_world();
    let scoring = rows
        .into_iter()
        .filter(|row| row.state == NodeState::Done && playbook.contains(&row.node_id))
        .filter(|row| playbook.world_of(&row.node_id) != optional)
        .count();
    u32::try_from(scoring)
        .unwrap_or(u32::MAX)
        .saturating_mul(POINTS_PER_NODE)
}

/// Highest score first, then name and id; ranks count from 1
#[must_use]
pub fn rank(mut entries: Vec<ScoreboardEntry>) -> Vec<ScoreboardEntry> {
    entries.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.name.cmp(&b.name))
            .then(a.student.cmp(&b.student))
    });
    for (index, entry) in entries.iter_mut().enumerate() {
        entry.rank = index + 1;
    }
    entries
}

/// First instant of the UTC month containing `now`
#[must_use]
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Percentage with an empty denominator reading as zero
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

//! Progress and monitoring operations for admins and advisors
//!
//! All reads come from one snapshot, so a listing never mixes states from
//! different commits. Cancellation is honoured between students.

use crate::api::{
    AnalyticsSummary, JourneyNodeView, MonitorFilter, MonitorRow, ProgressRow, Scoreboard,
    ScoreboardEntry,
};
use crate::collab::StudentRecord;
use crate::engine::JourneyEngine;
use crate::error::Result;
use crate::store::Tables;
use crate::types::{Actor, NodeInstance, NodeState, UserId};
use crate::views;
use journey_playbook::{Playbook, TenantId};
use std::collections::BTreeMap;

impl JourneyEngine {
    /// Directory students plus any student that has instances but no record
    fn roster(&self, tenant: TenantId, tables: &Tables) -> Vec<StudentRecord> {
        let mut roster: BTreeMap<UserId, StudentRecord> = self
            .inner
            .directory
            .students(tenant)
            .into_iter()
            .map(|record| (record.id, record))
            .collect();
        for student in tables.students(tenant) {
            roster
                .entry(student)
                .or_insert_with(|| StudentRecord::unknown(student));
        }
        roster.into_values().collect()
    }

    /// Students passing `filter`, sorted by name, with their advisors
    fn select(
        &self,
        filter: &MonitorFilter,
        tables: &Tables,
    ) -> Result<Vec<(StudentRecord, Vec<UserId>)>> {
        let mut selected = Vec::new();
        for record in self.roster(filter.tenant, tables) {
            self.cancel.check()?;
            let advisors = self.inner.advisors.advisors_of(filter.tenant, record.id);
            if filter.matches(&record, &advisors) {
                selected.push((record, advisors));
            }
        }
        selected.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(selected)
    }

    /// Completion percentage and current stage of every student
    pub fn list_progress(&self, tenant: TenantId) -> Result<Vec<ProgressRow>> {
        let playbook = self.active_playbook(tenant)?;
        let tables = self.snapshot();
        let mut rows = Vec::new();
        for record in self.roster(tenant, &tables) {
            self.cancel.check()?;
            let instances =
                views::instances_in_version(&tables, tenant, record.id, playbook.version_id());
            let progress = views::progress(&playbook, &instances, record.rp_required);
            rows.push(ProgressRow {
                student: record.id,
                completed: progress.completed,
                total: progress.total,
                percent: progress.percent,
                current_stage: views::current_stage(&playbook, &instances),
            });
        }
        Ok(rows)
    }

    /// One row per selected student, paged by the filter
    pub fn monitor_students(&self, filter: &MonitorFilter) -> Result<Vec<MonitorRow>> {
        let playbook = self.active_playbook(filter.tenant)?;
        let tables = self.snapshot();
        let selected = self.select(filter, &tables)?;
        let page = selected
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX));

        let mut rows = Vec::new();
        for (student, advisors) in page {
            self.cancel.check()?;
            let instances = views::instances_in_version(
                &tables,
                filter.tenant,
                student.id,
                playbook.version_id(),
            );
            let progress = views::progress(&playbook, &instances, student.rp_required);
            let last_update = tables
                .instances_of(filter.tenant, student.id)
                .map(|i| i.updated_at)
                .max();
            rows.push(MonitorRow {
                advisors,
                done_count: progress.completed,
                total: progress.total,
                last_update,
                overall_pct: progress.percent,
                current_stage: views::current_stage(&playbook, &instances),
                student,
            });
        }
        Ok(rows)
    }

    /// Aggregates over the selected students (paging ignored)
    pub fn monitor_analytics(&self, filter: &MonitorFilter) -> Result<AnalyticsSummary> {
        let playbook = self.active_playbook(filter.tenant)?;
        let tables = self.snapshot();
        let selected = self.select(filter, &tables)?;
        let since = views::month_start(self.now());
        let antiplag = &self.inner.config.antiplag_node;

        let mut rp_required_count = 0;
        let mut antiplag_done_count = 0;
        let mut pending = Vec::new();
        let mut durations = Vec::new();
        for (student, _) in &selected {
            self.cancel.check()?;
            let instances = views::instances_in_version(
                &tables,
                filter.tenant,
                student.id,
                playbook.version_id(),
            );
            if student.rp_required {
                rp_required_count += 1;
            }
            if instances
                .iter()
                .any(|i| &i.node_id == antiplag && i.state == NodeState::Done)
            {
                antiplag_done_count += 1;
            }
            if let Some(days) = median_world_days(&playbook, &instances) {
                durations.push(days);
            }
            pending.extend(instances);
        }
        let bottleneck = views::bottleneck(pending, since);

        Ok(AnalyticsSummary {
            students: selected.len(),
            rp_required_count,
            antiplag_done_count,
            antiplag_done_pct: views::percent(antiplag_done_count, selected.len()),
            bottleneck_count: bottleneck.as_ref().map_or(0, |(_, count)| *count),
            bottleneck_node: bottleneck.map(|(node, _)| node),
            median_world: playbook.median_world().cloned(),
            stage_median_days: views::median(durations),
        })
    }

    /// Ranked points from the projection: each done node scores, except
    /// those in the playbook's optional world
    ///
    /// `me` is the caller's entry; a caller without points ranks right
    /// after the last listed student.
    pub fn scoreboard(&self, tenant: TenantId, caller: UserId) -> Result<Scoreboard> {
        let playbook = self.active_playbook(tenant)?;
        let tables = self.snapshot();
        let mut entries = Vec::new();
        for student in tables.students(tenant) {
            self.cancel.check()?;
            let score = views::score(&playbook, tables.projection_of(tenant, student));
            if score == 0 {
                continue;
            }
            let record = self.inner.directory.student(tenant, student);
            entries.push(ScoreboardEntry {
                student,
                name: display_name(record.as_ref(), "Unknown"),
                score,
                rank: 0,
            });
        }
        let entries = views::rank(entries);

        let total: u64 = entries.iter().map(|e| u64::from(e.score)).sum();
        let ranked = u64::try_from(entries.len()).unwrap_or(u64::MAX).max(1);
        let average_score = u32::try_from(total / ranked).unwrap_or(u32::MAX);
        let me = entries
            .iter()
            .find(|e| e.student == caller)
            .cloned()
            .unwrap_or_else(|| {
                let record = self.inner.directory.student(tenant, caller);
                ScoreboardEntry {
                    student: caller,
                    name: display_name(record.as_ref(), "You"),
                    score: 0,
                    rank: entries.len() + 1,
                }
            });

        Ok(Scoreboard {
            top: entries.iter().take(views::SCOREBOARD_TOP).cloned().collect(),
            average_score,
            me,
            total_users: entries.len(),
        })
    }

    /// Node-by-node state of one student's journey under the active playbook
    pub fn get_student_journey(
        &self,
        tenant: TenantId,
        student: UserId,
        caller: Actor,
    ) -> Result<Vec<JourneyNodeView>> {
        self.authorize(tenant, student, caller)?;
        let playbook = self.active_playbook(tenant)?;
        let tables = self.snapshot();
        let instances =
            views::instances_in_version(&tables, tenant, student, playbook.version_id());
        let by_node: BTreeMap<_, _> = instances.iter().map(|i| (&i.node_id, *i)).collect();

        Ok(playbook
            .nodes()
            .filter_map(|definition| by_node.get(&definition.id))
            .map(|instance| {
                let active = tables
                    .attachments_of_instance(instance.instance_id)
                    .filter(|a| a.is_active);
                JourneyNodeView {
                    node_id: instance.node_id.clone(),
                    world: playbook.world_of(&instance.node_id).cloned(),
                    title: playbook.title(&instance.node_id, instance.locale.as_deref()),
                    state: instance.state,
                    updated_at: instance.updated_at,
                    attachments: views::tally(active),
                }
            })
            .collect())
    }
}

/// Directory name, else email, else `fallback`
fn display_name(record: Option<&StudentRecord>, fallback: &str) -> String {
    record
        .map(|r| r.name.trim())
        .filter(|name| !name.is_empty())
        .or_else(|| record.map(|r| r.email.trim()).filter(|email| !email.is_empty()))
        .unwrap_or(fallback)
        .to_string()
}

fn median_world_days(playbook: &Playbook, instances: &[&NodeInstance]) -> Option<f64> {
    let world = playbook.median_world()?;
    views::stage_duration_days(playbook, world, instances)
}

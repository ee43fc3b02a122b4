//! Per-tick dispatch
//!
//! Workers are visited in connection id order. For each one the plan is
//! decided against the build first and then carried out, so the build is
//! never borrowed across a send.

use chrono::{DateTime, Duration, Utc};
use eyre::Result;
use tracing::{debug, error, info};

use crate::domain::{Build, BuildStatus, ConnectionId, WorkItem, WorkItemStatus};
use crate::ipc::ServerMessage;
use crate::persistence::{BuildEvent, BuildEventType};
use crate::registry::WorkerInfo;

use super::core::Coordinator;

/// What one worker should do this tick
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchPlan {
    /// Nothing eligible right now
    Wait,
    /// Log in as `character` to deliver its items
    Switch { character: String },
    /// No remaining work for any of the worker's characters
    Drained,
    /// Deliver `item`; `retry` when it had already been sent once
    Give { item: WorkItem, retry: bool },
}

/// Decide the next action for one worker, stamping items as needed
pub fn plan_dispatch(build: &mut Build, worker: &WorkerInfo, now: DateTime<Utc>, window: Duration) -> DispatchPlan {
    let primary: Vec<usize> = build
        .items
        .iter()
        .enumerate()
        .filter(|(_, w)| w.character == worker.character && w.is_stale(now, window))
        .map(|(i, _)| i)
        .collect();

    let Some((&first, rest)) = primary.split_first() else {
        let alternate = build
            .items
            .iter()
            .find(|w| worker.alternates.contains(&w.character) && w.is_stale(now, window))
            .map(|w| w.character.clone());

        if let Some(character) = alternate {
            // Primary work in flight takes priority over switching away
            if build
                .items
                .iter()
                .any(|w| w.character == worker.character && w.is_outstanding())
            {
                return DispatchPlan::Wait;
            }
            for item in build.items.iter_mut().filter(|w| w.character == character) {
                item.stamp(now);
            }
            return DispatchPlan::Switch { character };
        }

        let has_work = build
            .items
            .iter()
            .any(|w| worker.identities().any(|name| name == w.character));
        return if has_work { DispatchPlan::Wait } else { DispatchPlan::Drained };
    };

    for &i in rest {
        build.items[i].stamp(now);
    }
    let item = &mut build.items[first];
    let retry = item.status == WorkItemStatus::InProgress || item.attempts > 0;
    item.mark_dispatched(now);
    DispatchPlan::Give {
        item: item.clone(),
        retry,
    }
}

impl Coordinator {
    /// Run one dispatch pass over the active build
    pub(super) fn tick(&mut self, now: DateTime<Utc>) {
        let Some(build) = self.build.as_ref() else {
            return;
        };

        if build.items.is_empty() {
            self.complete_build(now);
            return;
        }
        if build.has_failed() {
            self.finish_build(BuildStatus::Failed, now);
            return;
        }

        let workers: Vec<ConnectionId> = self
            .registry
            .workers()
            .map(|(id, _)| id)
            .filter(|id| !build.drained.contains(id))
            .collect();

        for id in workers {
            if self.build.as_ref().is_none_or(|b| b.has_failed()) {
                break;
            }
            if let Err(e) = self.dispatch_to(id, now) {
                error!(connection = id, error = %e, "Dispatch failed");
                self.record_error(format!("Dispatch to connection {id} failed: {e}"), now);
            }
        }
    }

    fn dispatch_to(&mut self, id: ConnectionId, now: DateTime<Utc>) -> Result<()> {
        let Some(worker) = self.registry.worker(id).cloned() else {
            debug!(connection = id, "dispatch_to: worker vanished, skipping");
            return Ok(());
        };
        let window = self.config.redelivery_window();
        let Some(build) = self.build.as_mut() else {
            return Ok(());
        };
        let deliver_to = build.drop_character.clone();

        match plan_dispatch(build, &worker, now, window) {
            DispatchPlan::Wait => Ok(()),
            DispatchPlan::Drained => {
                build.drained.insert(id);
                info!(connection = id, account = %worker.account, "Completed account {}", worker.character);
                Ok(())
            }
            DispatchPlan::Switch { character } => {
                info!(connection = id, from = %worker.character, to = %character, "Switching character");
                self.log_event(
                    BuildEvent::new(
                        BuildEventType::CharacterSwitch,
                        format!("Switch from {} to {}", worker.character, character),
                        now,
                    )
                    .with_character(&character),
                );
                self.registry.send(id, ServerMessage::SwitchCharacter { character })?;
                Ok(())
            }
            DispatchPlan::Give { item, retry } => {
                if let Some(snapshot) = self.snapshot.as_mut() {
                    snapshot.sync_item(&item);
                }
                self.persist(now);

                let event_type = if retry {
                    BuildEventType::WorkItemRetry
                } else {
                    BuildEventType::WorkItemAssigned
                };
                info!(
                    connection = id,
                    work_id = item.id,
                    character = %item.character,
                    attempt = item.attempts,
                    "Sending {} to {}",
                    item.item_name,
                    deliver_to
                );
                self.log_event(
                    BuildEvent::new(event_type, format!("Give {} to {}", item.item_name, deliver_to), now)
                        .with_item(item.id)
                        .with_character(&item.character)
                        .with_details(format!("Attempt {}", item.attempts)),
                );
                self.registry.send(
                    id,
                    ServerMessage::GiveItem {
                        work_id: item.id,
                        item_name: item.item_name,
                        material_id: item.material_id,
                        set_id: item.set_id,
                        required_spells: item.requirements,
                        deliver_to,
                    },
                )?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn window() -> Duration {
        Duration::seconds(30)
    }

    fn worker(character: &str, alternates: &[&str]) -> WorkerInfo {
        WorkerInfo::new("acct", character, "", alternates.iter().map(|s| s.to_string()).collect())
    }

    fn build(items: &[(u32, &str)]) -> Build {
        let items = items.iter().map(|(id, c)| WorkItem::new(*id, *c, format!("Item{id}"))).collect();
        Build::new("Suit", "Collector", 1, items, t0())
    }

    #[test]
    fn test_gives_first_primary_item_and_stamps_siblings() {
        let mut b = build(&[(1, "Alice"), (2, "Bob"), (3, "Alice")]);
        let plan = plan_dispatch(&mut b, &worker("Alice", &[]), t0(), window());

        let DispatchPlan::Give { item, retry } = plan else {
            panic!("expected give, got {plan:?}");
        };
        assert_eq!(item.id, 1);
        assert!(!retry);
        assert_eq!(b.item(1).unwrap().status, WorkItemStatus::InProgress);
        assert_eq!(b.item(3).unwrap().last_dispatch, Some(t0()));
        assert_eq!(b.item(3).unwrap().status, WorkItemStatus::Pending);
        assert!(b.item(2).unwrap().last_dispatch.is_none());
    }

    #[test]
    fn test_waits_inside_redelivery_window() {
        let mut b = build(&[(1, "Alice"), (2, "Alice")]);
        let alice = worker("Alice", &[]);
        assert!(matches!(plan_dispatch(&mut b, &alice, t0(), window()), DispatchPlan::Give { .. }));
        let later = t0() + Duration::seconds(10);
        assert_eq!(plan_dispatch(&mut b, &alice, later, window()), DispatchPlan::Wait);
    }

    #[test]
    fn test_redelivers_after_window() {
        let mut b = build(&[(1, "Alice")]);
        let alice = worker("Alice", &[]);
        plan_dispatch(&mut b, &alice, t0(), window());
        let plan = plan_dispatch(&mut b, &alice, t0() + Duration::seconds(31), window());
        let DispatchPlan::Give { item, retry } = plan else {
            panic!("expected redelivery, got {plan:?}");
        };
        assert_eq!(item.id, 1);
        assert!(retry);
        assert_eq!(item.attempts, 2);
    }

    #[test]
    fn test_switches_to_alternate_when_primary_idle() {
        let mut b = build(&[(1, "Bob"), (2, "Bob"), (3, "Carol")]);
        let plan = plan_dispatch(&mut b, &worker("Alice", &["Bob", "Carol"]), t0(), window());
        assert_eq!(
            plan,
            DispatchPlan::Switch {
                character: "Bob".to_string()
            }
        );
        assert_eq!(b.item(1).unwrap().last_dispatch, Some(t0()));
        assert_eq!(b.item(2).unwrap().last_dispatch, Some(t0()));
        assert!(b.item(3).unwrap().last_dispatch.is_none());

        // Bob's items are suppressed, so the next tick moves on to Carol
        let plan = plan_dispatch(&mut b, &worker("Alice", &["Bob", "Carol"]), t0(), window());
        assert_eq!(
            plan,
            DispatchPlan::Switch {
                character: "Carol".to_string()
            }
        );
    }

    #[test]
    fn test_no_switch_while_primary_has_outstanding_work() {
        let mut b = build(&[(1, "Alice"), (2, "Bob")]);
        let alice = worker("Alice", &["Bob"]);
        assert!(matches!(plan_dispatch(&mut b, &alice, t0(), window()), DispatchPlan::Give { .. }));
        assert_eq!(plan_dispatch(&mut b, &alice, t0(), window()), DispatchPlan::Wait);
        assert!(b.item(2).unwrap().last_dispatch.is_none());
    }

    #[test]
    fn test_drained_when_no_work_for_identities() {
        let mut b = build(&[(1, "Bob")]);
        assert_eq!(
            plan_dispatch(&mut b, &worker("Alice", &["Carol"]), t0(), window()),
            DispatchPlan::Drained
        );
    }

    #[test]
    fn test_failed_item_is_not_dispatched() {
        let mut b = build(&[(1, "Alice")]);
        b.item_mut(1).unwrap().mark_abandoned();
        assert_eq!(plan_dispatch(&mut b, &worker("Alice", &[]), t0(), window()), DispatchPlan::Wait);
    }
}

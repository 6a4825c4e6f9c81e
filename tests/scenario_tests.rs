//! Full stop/start cycles across master outages and control process restarts.
//!
//! Each scenario ends by checking the master's directive log: every launch
//! and every kill must have been received exactly once.

mod test_harness;

use std::collections::HashMap;
use std::time::Duration;

use jobmgr_lite::job::{GoalState, TaskState};
use jobmgr_lite::master::simulated::Directive;
use jobmgr_lite::master::SimulatedMaster;
use test_harness::TestJobManager;

const INSTANCES: u32 = 3;

/// How long the master stays down after a goal change.
const OUTAGE: Duration = Duration::from_millis(300);

fn assert_no_duplicate_directives(master: &SimulatedMaster) {
    let mut seen: HashMap<Directive, usize> = HashMap::new();
    for directive in master.directives() {
        *seen.entry(directive).or_insert(0) += 1;
    }
    let duplicates: Vec<_> = seen.into_iter().filter(|(_, n)| *n > 1).collect();
    assert!(duplicates.is_empty(), "duplicate directives: {:?}", duplicates);
}

#[tokio::test]
async fn test_stop_start_cycle_across_master_outages() {
    let jm = TestJobManager::start().await;
    let job_id = jm.create_job("cycle", INSTANCES);
    jm.converge(job_id, GoalState::Running).await;

    jm.master.stop();
    jm.api().stop(job_id).unwrap();
    tokio::time::sleep(OUTAGE).await;
    jm.master.start();
    let stopped = jm.converge(job_id, GoalState::Killed).await;
    assert!(stopped.tasks.iter().all(|t| t.actual == TaskState::Killed));

    jm.master.stop();
    jm.api().start(job_id).unwrap();
    tokio::time::sleep(OUTAGE).await;
    jm.master.start();
    let running = jm.converge(job_id, GoalState::Running).await;
    assert!(running.tasks.iter().all(|t| t.actual == TaskState::Running));

    assert_eq!(jm.master.launches_for_job(job_id), 2 * INSTANCES as usize);
    assert_eq!(jm.master.kills_for_job(job_id), INSTANCES as usize);
    assert_eq!(jm.master.live_handles().len(), INSTANCES as usize);
    assert_no_duplicate_directives(&jm.master);

    jm.shutdown().await;
}

#[tokio::test]
async fn test_stop_start_cycle_with_restarts_during_outages() {
    let mut jm = TestJobManager::start().await;
    let job_id = jm.create_job("cycle", INSTANCES);
    jm.converge(job_id, GoalState::Running).await;

    jm.master.stop();
    jm.api().stop(job_id).unwrap();
    tokio::time::sleep(OUTAGE / 2).await;
    jm.restart().await;
    tokio::time::sleep(OUTAGE / 2).await;
    jm.master.start();
    let stopped = jm.converge(job_id, GoalState::Killed).await;
    assert!(stopped.tasks.iter().all(|t| t.actual == TaskState::Killed));

    jm.master.stop();
    jm.api().start(job_id).unwrap();
    tokio::time::sleep(OUTAGE / 2).await;
    jm.restart().await;
    tokio::time::sleep(OUTAGE / 2).await;
    jm.master.start();
    let running = jm.converge(job_id, GoalState::Running).await;
    assert!(running.tasks.iter().all(|t| t.actual == TaskState::Running));

    // Same end state and directive counts as without the restarts
    assert_eq!(jm.master.launches_for_job(job_id), 2 * INSTANCES as usize);
    assert_eq!(jm.master.kills_for_job(job_id), INSTANCES as usize);
    assert_eq!(jm.master.live_handles().len(), INSTANCES as usize);
    assert_no_duplicate_directives(&jm.master);

    jm.shutdown().await;
}

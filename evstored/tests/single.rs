mod common;

use common::*;
use evstored::message::ClientResponse;
use evstored::{OperationResult, VNodeState};

fn events(prefix: u8, count: u8) -> Vec<Vec<u8>> {
    (0..count).map(|i| vec![prefix, i, 0xee]).collect()
}

#[test]
fn single_node_becomes_master() -> anyhow::Result<()> {
    let node = TestNode::single()?;

    node.wait_for_state(&[VNodeState::Master])?;

    Ok(())
}

#[test]
fn single_node_commits_writes() -> anyhow::Result<()> {
    let node = TestNode::single()?;
    node.wait_for_state(&[VNodeState::Master])?;

    let mut last = -1;
    for batch in 0..10 {
        match node.write(events(batch, 3), true)? {
            ClientResponse::WriteCompleted {
                result: OperationResult::Success,
                first_position,
                last_position,
            } => {
                assert!(last <= first_position);
                assert!(first_position < last_position);
                last = last_position;
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    let expected: Vec<_> = (0..10).flat_map(|batch| events(batch, 3)).collect();
    wait_for(|| {
        let read = node.ctrl().read_events().ok()?;
        (read == expected).then_some(())
    })?;
    wait_for(|| (last <= node.ctrl().last_commit_position()).then_some(()))?;

    Ok(())
}

#[test]
fn oversized_event_is_rejected() -> anyhow::Result<()> {
    let node = TestNode::single()?;
    node.wait_for_state(&[VNodeState::Master])?;

    let res = node.write(vec![vec![0u8; 2 * 1024 * 1024]], true)?;
    assert!(matches!(
        res,
        ClientResponse::WriteCompleted {
            result: OperationResult::InvalidTransaction,
            ..
        }
    ));

    // node keeps working afterwards
    let res = node.write(events(1, 1), true)?;
    assert!(matches!(
        res,
        ClientResponse::WriteCompleted {
            result: OperationResult::Success,
            ..
        }
    ));

    Ok(())
}

#[test]
fn writes_survive_restart() -> anyhow::Result<()> {
    let mut node = TestNode::single()?;
    node.wait_for_state(&[VNodeState::Master])?;

    for batch in 0..3 {
        node.write(events(batch, 5), true)?;
    }

    node.restart()?;
    node.wait_for_state(&[VNodeState::Master])?;
    node.write(events(3, 5), true)?;

    let expected: Vec<_> = (0..4).flat_map(|batch| events(batch, 5)).collect();
    wait_for(|| {
        let read = node.ctrl().read_events().ok()?;
        (read == expected).then_some(())
    })?;

    Ok(())
}

#[test]
fn stopped_node_shuts_down() -> anyhow::Result<()> {
    let node = TestNode::single()?;
    node.wait_for_state(&[VNodeState::Master])?;

    node.ctrl().stop();
    node.wait_for_state(&[VNodeState::Shutdown])?;

    // nobody is left to answer
    assert!(node.write(events(0, 1), false).is_err());
    assert!(node.ctrl().db().is_closed());

    Ok(())
}

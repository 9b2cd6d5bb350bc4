//! Tree synchronization end to end: reloads, live changes and recovery
mod common;

use std::time::Duration;

use ::common::prelude::*;
use ::common::testkit::MockConnector;
use ::common::tree::NodeType;
use ::common::wire::{Action, EventPayload, ResponseFrame};

use crate::common::{endpoint, fast_config, init_tracing, next_event, served_client};

fn node_type(tree: &KeyTree<Record>, key: &str) -> Option<NodeType> {
    tree.node(&::common::tree::key_to_paths(key.as_bytes()))
        .map(|node| node.node_type())
}

fn value(tree: &KeyTree<Record>, key: &str) -> Option<String> {
    tree.get_key(key.as_bytes())
        .and_then(|record| record.value_text().map(|text| text.into_owned()))
}

#[tokio::test]
async fn test_initial_load_projects_the_keyspace() -> anyhow::Result<()> {
    let (client, events, server) = served_client(fast_config()).await;
    server.put("/a", "1");
    server.put("/a/b", "2");
    server.put("/c/d/e", "3");

    let (_task, mut tree) = TreeSync::spawn(client, events);
    tree.wait_for(|tree| tree.len() == 3).await?;

    let snapshot = tree.snapshot();
    assert_eq!(node_type(&snapshot, "/a"), Some(NodeType::FileDirectory));
    assert_eq!(node_type(&snapshot, "/a/b"), Some(NodeType::File));
    assert_eq!(node_type(&snapshot, "/c"), Some(NodeType::Directory));
    assert_eq!(node_type(&snapshot, "/c/d/e"), Some(NodeType::File));
    assert!(tree.generation() >= 1);
    Ok(())
}

#[tokio::test]
async fn test_live_changes_follow_the_store() -> anyhow::Result<()> {
    let (client, events, server) = served_client(fast_config()).await;
    server.put("/a", "1");

    let (_task, mut tree) = TreeSync::spawn(client.clone(), events);
    tree.wait_for(|tree| tree.len() == 1).await?;

    client.put("/a/b", "2", 0).await?;
    tree.wait_for(|tree| tree.len() == 2).await?;
    tree.read(|tree| {
        assert_eq!(node_type(tree, "/a"), Some(NodeType::FileDirectory));
        assert_eq!(value(tree, "/a/b").as_deref(), Some("2"));
    });

    server.put("/a/b", "3");
    tree.wait_for(|tree| value(tree, "/a/b").as_deref() == Some("3"))
        .await?;

    client.del("/a", false).await?;
    tree.wait_for(|tree| node_type(tree, "/a") == Some(NodeType::Directory))
        .await?;
    tree.read(|tree| assert_eq!(value(tree, "/a/b").as_deref(), Some("3")));

    server.delete("/a/b");
    tree.wait_for(|tree| tree.is_empty() && tree.root().children().is_empty())
        .await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_reloads_and_replaces_the_tree() -> anyhow::Result<()> {
    let (client, events, server) = served_client(fast_config()).await;
    let mut lifecycle = client.subscribe();
    server.put("/keep", "1");
    server.put("/gone", "1");

    let (_task, mut tree) = TreeSync::spawn(client, events);
    tree.wait_for(|tree| tree.len() == 2).await?;

    server.drop_connections();
    assert_eq!(next_event(&mut lifecycle).await, SessionEvent::Close);
    // while nobody is connected no watch event can report these
    server.delete("/gone");
    server.put("/new", "1");

    assert_eq!(next_event(&mut lifecycle).await, SessionEvent::Reconnect);
    tree.wait_for(|tree| tree.get_key(b"/new").is_some()).await?;
    tree.read(|tree| {
        assert!(tree.get_key(b"/keep").is_some());
        assert!(tree.get_key(b"/gone").is_none());
        assert_eq!(tree.len(), 2);
    });
    assert_eq!(server.connections(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_aborted_reload_keeps_tree_and_retries() -> anyhow::Result<()> {
    let (client, events, server) = served_client(fast_config()).await;
    let mut lifecycle = client.subscribe();
    server.put("/a", "1");
    server.put("/b", "1");

    let (_task, mut tree) = TreeSync::spawn(client, events);
    tree.wait_for(|tree| tree.len() == 2).await?;

    server.reject(Action::Query, Some("unavailable"));
    server.drop_connections();
    assert_eq!(next_event(&mut lifecycle).await, SessionEvent::Close);
    server.delete("/b");
    assert_eq!(next_event(&mut lifecycle).await, SessionEvent::Reconnect);

    // shorter than the retry delay: the failed reload has run its course
    tokio::time::sleep(Duration::from_millis(10)).await;
    let generation = tree.generation();
    tree.read(|tree| assert!(tree.get_key(b"/b").is_some()));

    server.reject(Action::Query, None);
    tree.wait_for(|tree| tree.get_key(b"/b").is_none()).await?;
    assert!(tree.generation() > generation);
    tree.read(|tree| assert_eq!(tree.len(), 1));
    Ok(())
}

#[tokio::test]
async fn test_sync_stops_with_the_client() -> anyhow::Result<()> {
    let (client, events, _server) = served_client(fast_config()).await;
    let (task, mut tree) = TreeSync::spawn(client.clone(), events);
    tree.changed().await?;

    client.close().await;
    task.await?;
    assert!(tree.changed().await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_prefix_switch_reloads_only_the_new_prefix() -> anyhow::Result<()> {
    let (client, events, server) = served_client(fast_config()).await;
    server.put("/a/1", "1");
    server.put("/a/2", "2");
    server.put("/b/1", "3");

    let (_task, mut tree) = TreeSync::spawn(client.clone(), events);
    tree.wait_for(|tree| tree.len() == 3).await?;

    let generation = tree.generation();
    tree.set_prefix("/b")?;
    tree.wait_for(|tree| tree.len() == 1 && tree.get_key(b"/b/1").is_some())
        .await?;
    assert!(tree.generation() > generation);

    // changes outside the followed prefix are left out
    client.put("/a/3", "4", 0).await?;
    client.put("/b/2", "5", 0).await?;
    tree.wait_for(|tree| tree.get_key(b"/b/2").is_some()).await?;
    tree.read(|tree| {
        let keys: Vec<_> = tree.leaves().into_iter().map(|(key, _)| key.to_string()).collect();
        assert_eq!(keys, vec!["/b/1", "/b/2"]);
        assert_eq!(node_type(tree, "/a"), None);
    });

    tree.set_prefix("/")?;
    tree.wait_for(|tree| tree.len() == 5).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_changes_already_in_the_scan_are_not_reapplied() -> anyhow::Result<()> {
    init_tracing();
    let (connector, mut listener) = MockConnector::new();
    let (client, events) = Client::connect(endpoint(), fast_config(), connector);
    let (_task, mut tree) = TreeSync::spawn(client, events);
    let mut link = listener.accept().await.unwrap();

    let query = link.recv_call().await?;
    assert_eq!(query.action, Action::Query);
    let page = EventPayload {
        header: ResponseHeader::new(10),
        kvs: vec![Record::key_only("/a")],
        ..Default::default()
    };
    link.send(&ResponseFrame::success(query.id, query.action, &page))?;

    // "/a" was created at the scan's revision, then "/c" after it
    link.send(&ResponseFrame::watch(&ChangeEvent::Create {
        header: ResponseHeader::new(10),
        kvs: vec![Record::key_only("/a").with_value("1")],
    }))?;
    link.send(&ResponseFrame::watch(&ChangeEvent::Create {
        header: ResponseHeader::new(11),
        kvs: vec![Record::key_only("/c").with_value("2")],
    }))?;

    tree.wait_for(|tree| tree.get_key(b"/c").is_some()).await?;
    tree.read(|tree| {
        assert_eq!(tree.len(), 2);
        assert!(tree.get_key(b"/a").is_some());
    });
    // a duplicate create would have forced another scan
    assert!(
        tokio::time::timeout(Duration::from_secs(1), link.recv_call())
            .await
            .is_err()
    );
    Ok(())
}

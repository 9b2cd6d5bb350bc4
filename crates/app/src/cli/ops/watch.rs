use std::pin::pin;

use clap::Args;
use tokio::sync::broadcast;

use common::prelude::*;
use common::wire::ChangeKind;

use crate::cli::op::{ContextError, OpContext};

/// Follow changes until interrupted
#[derive(Args, Debug, Clone)]
pub struct Watch {
    /// Re-render the whole tree after every change instead of printing events
    #[arg(long)]
    pub tree: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Watch {
    type Error = WatchError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let (client, events) = ctx.connect().await?;
        let updates = if self.tree {
            follow_tree(&client, events).await
        } else {
            follow_events(events).await
        };
        client.close().await;
        Ok(format!("Stopped after {updates} updates"))
    }
}

async fn follow_events(mut events: broadcast::Receiver<SessionEvent>) -> usize {
    let mut stop = pin!(tokio::signal::ctrl_c());
    let mut updates = 0;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Data(change)) => {
                    for line in describe(&change) {
                        println!("{line}");
                    }
                    updates += 1;
                }
                Ok(SessionEvent::Close) => eprintln!("connection lost, reconnecting"),
                Ok(SessionEvent::Reconnect) => {
                    eprintln!("reconnected; changes made while disconnected were not reported")
                }
                Ok(SessionEvent::Open) | Ok(SessionEvent::Error(_)) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    eprintln!("missed {missed} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    updates
}

async fn follow_tree(client: &Client, events: broadcast::Receiver<SessionEvent>) -> usize {
    let (_sync, mut tree) = TreeSync::spawn(client.clone(), events);
    let mut stop = pin!(tokio::signal::ctrl_c());
    let mut updates = 0;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            changed = tree.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", tree.read(|tree| tree.render()));
                updates += 1;
            }
        }
    }
    updates
}

/// One line per affected key
fn describe(change: &ChangeEvent) -> Vec<String> {
    let revision = change.revision();
    match change {
        ChangeEvent::Create { kvs, .. } | ChangeEvent::Update { kvs, .. } => {
            let verb = match change.kind() {
                ChangeKind::Create => "create",
                _ => "update",
            };
            kvs.iter()
                .map(|record| {
                    format!(
                        "[{revision}] {verb} {} = {}",
                        record.key_text(),
                        record.value_text().unwrap_or_default()
                    )
                })
                .collect()
        }
        ChangeEvent::Delete { prev_kv, .. } => {
            vec![format!("[{revision}] delete {}", prev_kv.key_text())]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_lists_every_key() {
        let change = ChangeEvent::Create {
            header: ResponseHeader::new(7),
            kvs: vec![
                Record::key_only("/a").with_value("1"),
                Record::key_only("/b").with_value("2"),
            ],
        };
        assert_eq!(
            describe(&change),
            vec!["[7] create /a = 1", "[7] create /b = 2"]
        );

        let change = ChangeEvent::Delete {
            header: ResponseHeader::new(8),
            prev_kv: Record::key_only("/a"),
        };
        assert_eq!(describe(&change), vec!["[8] delete /a"]);
    }
}

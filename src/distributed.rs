//! Rank roles and the broadcast used to share a batch descriptor across a
//! tensor-parallel group.
//!
//! Rank 0 is the coordinating rank: it schedules, broadcasts the batch and
//! distributes results. Every other rank only receives the batch and takes
//! part in execution.

use crate::error::{Error, Result};
use flume::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// On the coordinating rank, sends `payload` to every peer and hands it
    /// back. On the other ranks, waits up to `wait` for the coordinator's
    /// payload; `Ok(None)` means nothing arrived in time.
    fn broadcast(&self, payload: Option<Vec<u8>>, wait: Duration) -> Result<Option<Vec<u8>>>;
}

/// Single-rank deployment.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, payload: Option<Vec<u8>>, _wait: Duration) -> Result<Option<Vec<u8>>> {
        Ok(payload)
    }
}

/// In-process group where each rank runs on its own thread.
#[derive(Debug)]
pub struct ChannelCollective {
    rank: usize,
    world_size: usize,
    peers: Vec<Sender<Vec<u8>>>,
    inbox: Option<Receiver<Vec<u8>>>,
}

impl ChannelCollective {
    /// One handle per rank, rank 0 first.
    pub fn group(world_size: usize) -> Vec<ChannelCollective> {
        let world_size = world_size.max(1);
        let (peers, inboxes): (Vec<_>, Vec<_>) =
            (1..world_size).map(|_| flume::unbounded()).unzip();
        let mut group = vec![ChannelCollective {
            rank: 0,
            world_size,
            peers,
            inbox: None,
        }];
        for (i, inbox) in inboxes.into_iter().enumerate() {
            group.push(ChannelCollective {
                rank: i + 1,
                world_size,
                peers: Vec::new(),
                inbox: Some(inbox),
            });
        }
        group
    }
}

impl Collective for ChannelCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast(&self, payload: Option<Vec<u8>>, wait: Duration) -> Result<Option<Vec<u8>>> {
        if self.is_coordinator() {
            let payload = payload.ok_or_else(|| {
                Error::Collective("coordinating rank has nothing to broadcast".to_string())
            })?;
            for (i, peer) in self.peers.iter().enumerate() {
                peer.send(payload.clone()).map_err(|_| {
                    Error::Collective(format!("rank {} left the group", i + 1))
                })?;
            }
            return Ok(Some(payload));
        }
        let inbox = self
            .inbox
            .as_ref()
            .ok_or_else(|| Error::Collective(format!("rank {} has no inbox", self.rank)))?;
        match inbox.recv_timeout(wait) {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Collective(format!(
                "rank {} lost the coordinating rank",
                self.rank
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_is_coordinator() {
        let local = LocalCollective;
        assert!(local.is_coordinator());
        assert_eq!(local.world_size(), 1);
        let echoed = local
            .broadcast(Some(vec![1, 2]), Duration::from_millis(1))
            .unwrap();
        assert_eq!(echoed, Some(vec![1, 2]));
    }

    #[test]
    fn test_group_broadcast_reaches_peers() {
        let group = ChannelCollective::group(3);
        assert_eq!(group.len(), 3);
        assert!(group[0].is_coordinator());
        assert!(!group[2].is_coordinator());
        group[0]
            .broadcast(Some(vec![9]), Duration::from_millis(1))
            .unwrap();
        for peer in &group[1..] {
            let got = peer.broadcast(None, Duration::from_millis(50)).unwrap();
            assert_eq!(got, Some(vec![9]));
        }
    }

    #[test]
    fn test_peer_times_out_then_detects_disconnect() {
        let mut group = ChannelCollective::group(2);
        let peer = group.pop().unwrap();
        assert_eq!(peer.broadcast(None, Duration::from_millis(1)).unwrap(), None);
        drop(group);
        assert!(peer.broadcast(None, Duration::from_millis(1)).is_err());
    }
}

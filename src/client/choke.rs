use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::SocketAddr;

use rand::seq::IteratorRandom;

use crate::core::TransferRate;

const TOP_PEERS: usize = 3;

#[derive(Debug, Default)]
pub struct ChokeDecision {
    pub peers_to_choke: HashSet<SocketAddr>,
    pub peers_to_unchoke: HashSet<SocketAddr>,
}

/// Tit-for-tat: keep the fastest interested peers unchoked, plus one random
/// interested peer on optimistic rounds.
pub fn choke(
    interested: &HashSet<SocketAddr>,
    unchoked: &HashSet<SocketAddr>,
    transfer_rates: &HashMap<SocketAddr, TransferRate>,
    optimistic: bool,
) -> ChokeDecision {
    let mut heap = BinaryHeap::with_capacity(TOP_PEERS + 1);
    for peer in interested {
        let transfer_rate = transfer_rates.get(peer).unwrap_or(&TransferRate::EMPTY);
        heap.push(Reverse(PeerByTransferRate(*peer, *transfer_rate)));
        if heap.len() > TOP_PEERS {
            heap.pop();
        }
    }

    let mut peers_to_choke = unchoked.clone();
    let mut peers_to_unchoke = HashSet::with_capacity(TOP_PEERS + 1);
    for Reverse(PeerByTransferRate(peer, _)) in heap {
        peers_to_choke.remove(&peer);
        peers_to_unchoke.insert(peer);
    }

    if optimistic {
        let mut rng = rand::rng();
        let random_peer = interested
            .iter()
            .filter(|&peer| !peers_to_unchoke.contains(peer))
            .choose(&mut rng);
        if let Some(peer) = random_peer {
            peers_to_choke.remove(peer);
            peers_to_unchoke.insert(*peer);
        }
    }

    ChokeDecision {
        peers_to_choke,
        peers_to_unchoke,
    }
}

struct PeerByTransferRate(SocketAddr, TransferRate);

impl Eq for PeerByTransferRate {}

impl PartialEq for PeerByTransferRate {
    fn eq(&self, other: &Self) -> bool {
        self.1.eq(&other.1)
    }
}

impl Ord for PeerByTransferRate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.1.cmp(&other.1)
    }
}

impl PartialOrd for PeerByTransferRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

//! Network topology and link properties.

use aggtree::{Addr, Duration};
use hashbrown::HashMap;

/// Properties of a radio link between two nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Signal strength in dBm reported with every delivered frame.
    pub rssi: i16,
    /// Frame loss probability (0.0 to 1.0).
    pub loss_rate: f64,
    /// Propagation delay.
    pub delay: Duration,
    /// Whether the link currently carries frames.
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            rssi: -70,
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            active: true,
        }
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Symmetric connectivity between node addresses.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: HashMap<(Addr, Addr), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every node hears every other node.
    pub fn fully_connected(nodes: &[Addr]) -> Self {
        let mut topo = Self::new();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in &nodes[i + 1..] {
                topo.add_link(a, b, Link::default());
            }
        }
        topo
    }

    /// Each node hears only its predecessor and successor.
    pub fn chain(nodes: &[Addr]) -> Self {
        let mut topo = Self::new();
        for pair in nodes.windows(2) {
            topo.add_link(pair[0], pair[1], Link::default());
        }
        topo
    }

    /// The first node is the hub; every other node hears only the hub.
    pub fn star(nodes: &[Addr]) -> Self {
        let mut topo = Self::new();
        if let Some((&hub, spokes)) = nodes.split_first() {
            for &spoke in spokes {
                topo.add_link(hub, spoke, Link::default());
            }
        }
        topo
    }

    /// Add (or replace) the link between `a` and `b`.
    pub fn add_link(&mut self, a: Addr, b: Addr, link: Link) {
        self.links.insert(canonical_pair(a, b), link);
    }

    pub fn get_link(&self, a: Addr, b: Addr) -> Option<&Link> {
        self.links.get(&canonical_pair(a, b))
    }

    pub fn get_link_mut(&mut self, a: Addr, b: Addr) -> Option<&mut Link> {
        self.links.get_mut(&canonical_pair(a, b))
    }

    /// Whether a link exists between `a` and `b` and is active.
    pub fn is_connected(&self, a: Addr, b: Addr) -> bool {
        self.get_link(a, b).is_some_and(|link| link.active)
    }

    /// Nodes reachable from `node` over active links, in address order.
    pub fn neighbors(&self, node: Addr) -> Vec<Addr> {
        let mut result: Vec<Addr> = self
            .links
            .iter()
            .filter(|(_, link)| link.active)
            .filter_map(|(&(a, b), _)| {
                if a == node {
                    Some(b)
                } else if b == node {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        result.sort_unstable();
        result
    }

    /// Disable every link crossing between groups.
    ///
    /// Nodes not listed in any group form a group of their own.
    pub fn partition(&mut self, groups: &[Vec<Addr>]) {
        for (&(a, b), link) in self.links.iter_mut() {
            let group_a = groups.iter().position(|g| g.contains(&a));
            let group_b = groups.iter().position(|g| g.contains(&b));
            if group_a != group_b {
                link.active = false;
            }
        }
    }

    /// Re-enable every link.
    pub fn heal(&mut self) {
        for link in self.links.values_mut() {
            link.active = true;
        }
    }

    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    pub fn set_global_delay(&mut self, delay: Duration) {
        for link in self.links.values_mut() {
            link.delay = delay;
        }
    }
}

fn canonical_pair(a: Addr, b: Addr) -> (Addr, Addr) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

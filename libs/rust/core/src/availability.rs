//! Which registered clients can be sampled in a given round.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::client::Client;

pub trait Availability: Send + Sync {
    fn online<'a>(&self, round: usize, clients: &'a [Client]) -> Vec<&'a Client>;
}

/// Every client is always reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Availability for AlwaysOnline {
    fn online<'a>(&self, _round: usize, clients: &'a [Client]) -> Vec<&'a Client> { clients.iter().collect() }
}

/// Each client is independently offline with probability `rate` in a round.
/// Draws depend only on `(seed, round)`.
#[derive(Debug, Clone, Copy)]
pub struct RandomDropout {
    pub rate: f64,
    pub seed: u64,
}

impl Availability for RandomDropout {
    fn online<'a>(&self, round: usize, clients: &'a [Client]) -> Vec<&'a Client> {
        let mut rng = StdRng::seed_from_u64(self.seed ^ (round as u64).wrapping_mul(0xA24B_AED4_963E_E407));
        clients.iter().filter(|_| rng.gen::<f64>() >= self.rate).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ClientData, Dataset};

    fn pool(n: usize) -> Vec<Client> {
        (0..n).map(|i| Client::new(ClientData { id: format!("c{i}"), group: None, train: Dataset::default(), eval: Dataset::default() }, false)).collect()
    }

    #[test]
    fn always_online_returns_everyone() {
        let clients = pool(4);
        assert_eq!(AlwaysOnline.online(3, &clients).len(), 4);
    }

    #[test]
    fn dropout_is_reproducible_per_round() {
        let clients = pool(50);
        let d = RandomDropout { rate: 0.5, seed: 9 };
        let a: Vec<&str> = d.online(1, &clients).iter().map(|c| c.id()).collect();
        let b: Vec<&str> = d.online(1, &clients).iter().map(|c| c.id()).collect();
        assert_eq!(a, b);
        assert!(a.len() < 50 && !a.is_empty());
        assert!(RandomDropout { rate: 1.0, seed: 9 }.online(1, &clients).is_empty());
    }
}

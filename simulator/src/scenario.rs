//! Simulation scenarios.

use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// How operations are generated.
    pub workload: Workload,
    /// Relative weights of operation kinds.
    pub mix: OperationMix,
    /// Largest generated amount, in cents.
    pub max_amount_cents: i64,
}

/// Shapes of generated load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Workload {
    /// Uniformly random wallets.
    Random,
    /// Every operation touches the first wallet.
    Contention,
    /// Opposite transfers between the first two wallets.
    PingPong,
    /// Random load while commits fail and stall.
    Faults,
}

/// Relative weights for each operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMix {
    pub credit: u32,
    pub debit: u32,
    pub transfer: u32,
    pub reverse: u32,
}

/// One generated operation. Wallets are indexes into the provisioned set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Credit { wallet: usize, amount: Decimal },
    Debit { wallet: usize, amount: Decimal },
    Transfer { from: usize, to: usize, amount: Decimal },
    /// Reverse the task's most recent transfer.
    ReverseLast,
}

impl OperationMix {
    fn total(&self) -> u32 {
        self.credit + self.debit + self.transfer + self.reverse
    }
}

impl Scenario {
    /// Names accepted by [`Scenario::load`].
    pub const NAMES: [&'static str; 4] = ["random", "contention", "ping-pong", "faults"];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "random" => Ok(Self::random()),
            "contention" => Ok(Self::contention()),
            "ping-pong" => Ok(Self::ping_pong()),
            "faults" => Ok(Self::faults()),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (expected one of {})",
                name,
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Every workload transfers between two distinct wallets.
    pub const MIN_WALLETS: usize = 2;

    fn random() -> Self {
        Self {
            name: "random".to_string(),
            description: "Mixed credits, debits, transfers and reversals across all wallets"
                .to_string(),
            workload: Workload::Random,
            mix: OperationMix {
                credit: 2,
                debit: 2,
                transfer: 5,
                reverse: 1,
            },
            max_amount_cents: 5_000,
        }
    }

    fn contention() -> Self {
        Self {
            name: "contention".to_string(),
            description: "Every task hammers one hot wallet".to_string(),
            workload: Workload::Contention,
            mix: OperationMix {
                credit: 1,
                debit: 3,
                transfer: 6,
                reverse: 0,
            },
            max_amount_cents: 2_500,
        }
    }

    fn ping_pong() -> Self {
        Self {
            name: "ping-pong".to_string(),
            description: "Opposite-direction transfers between two wallets".to_string(),
            workload: Workload::PingPong,
            mix: OperationMix {
                credit: 0,
                debit: 0,
                transfer: 1,
                reverse: 0,
            },
            max_amount_cents: 500,
        }
    }

    fn faults() -> Self {
        Self {
            name: "faults".to_string(),
            description: "Random load while commits fail transiently and stall".to_string(),
            workload: Workload::Faults,
            ..Self::random()
        }
    }

    /// Draw the next operation for `task`.
    pub fn next_operation<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        wallets: usize,
        task: usize,
    ) -> Operation {
        let amount = Decimal::new(rng.gen_range(1..=self.max_amount_cents.max(1)), 2);

        if self.workload == Workload::PingPong {
            return if task % 2 == 0 {
                Operation::Transfer { from: 0, to: 1, amount }
            } else {
                Operation::Transfer { from: 1, to: 0, amount }
            };
        }

        let pick = rng.gen_range(0..self.mix.total().max(1));
        let mut threshold = self.mix.credit;
        if pick < threshold {
            let wallet = self.pick_wallet(rng, wallets);
            return Operation::Credit { wallet, amount };
        }
        threshold += self.mix.debit;
        if pick < threshold {
            let wallet = self.pick_wallet(rng, wallets);
            return Operation::Debit { wallet, amount };
        }
        threshold += self.mix.transfer;
        if pick < threshold {
            let (from, to) = self.pick_pair(rng, wallets);
            return Operation::Transfer { from, to, amount };
        }
        Operation::ReverseLast
    }

    fn pick_wallet<R: Rng + ?Sized>(&self, rng: &mut R, wallets: usize) -> usize {
        match self.workload {
            Workload::Contention => 0,
            _ => rng.gen_range(0..wallets),
        }
    }

    fn pick_pair<R: Rng + ?Sized>(&self, rng: &mut R, wallets: usize) -> (usize, usize) {
        if self.workload == Workload::Contention {
            let other = rng.gen_range(1..wallets);
            return if rng.gen_bool(0.5) { (0, other) } else { (other, 0) };
        }

        let from = rng.gen_range(0..wallets);
        let mut to = rng.gen_range(0..wallets - 1);
        if to >= from {
            to += 1;
        }
        (from, to)
    }
}

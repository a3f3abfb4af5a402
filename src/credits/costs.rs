use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditAction {
    Site,
    Image,
    Model,
    Effect,
}

impl CreditAction {
    pub const fn unit_cost(self) -> u64 {
        match self {
            Self::Site => 20,
            Self::Image => 10,
            Self::Model => 50,
            Self::Effect => 10,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Image => "image",
            Self::Model => "model",
            Self::Effect => "effect",
        }
    }
}

fn default_quantity() -> u32 {
    1
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditCharge {
    pub action: CreditAction,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

impl CreditCharge {
    pub fn new(action: CreditAction) -> Self {
        Self {
            action,
            quantity: 1,
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    /// Zero quantities bill as one unit.
    pub fn billed_quantity(&self) -> u32 {
        self.quantity.max(1)
    }

    pub fn cost(&self) -> u64 {
        self.action
            .unit_cost()
            .saturating_mul(u64::from(self.billed_quantity()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeLine {
    pub action: CreditAction,
    pub quantity: u32,
    pub unit_cost: u64,
    pub cost: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeBreakdown {
    pub items: Vec<ChargeLine>,
    pub total_cost: u64,
}

impl ChargeBreakdown {
    pub fn from_charges(charges: &[CreditCharge]) -> Self {
        let items: Vec<ChargeLine> = charges
            .iter()
            .map(|charge| ChargeLine {
                action: charge.action,
                quantity: charge.billed_quantity(),
                unit_cost: charge.action.unit_cost(),
                cost: charge.cost(),
            })
            .collect();
        let total_cost = items
            .iter()
            .fold(0u64, |acc, item| acc.saturating_add(item.cost));
        Self { items, total_cost }
    }
}

pub fn total_cost(charges: &[CreditCharge]) -> u64 {
    charges
        .iter()
        .fold(0u64, |acc, charge| acc.saturating_add(charge.cost()))
}

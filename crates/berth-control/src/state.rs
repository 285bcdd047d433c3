use berth_agent::{CreatePolicy, Orchestrator};

use crate::hub::SubscriptionHub;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub hub: SubscriptionHub,
    pub create_policy: CreatePolicy,
}

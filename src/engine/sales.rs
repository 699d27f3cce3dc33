use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::engine::settlement::FarePolicy;
use crate::store::Store;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChairSales {
    pub id: Uuid,
    pub name: String,
    pub sales: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelSales {
    pub model: String,
    pub sales: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SalesReport {
    pub total_sales: i64,
    pub chairs: Vec<ChairSales>,
    pub models: Vec<ModelSales>,
}

/// Fares earned by an owner's chairs from rides completed within
/// `[since, until]`. Every chair is listed, idle ones with zero sales;
/// models come out in name order.
pub fn sales_report(
    store: &Store,
    fares: &FarePolicy,
    owner_id: Uuid,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> SalesReport {
    let chairs = store.chairs_for_owner(owner_id);
    let chair_ids: Vec<Uuid> = chairs.iter().map(|chair| chair.id).collect();

    let mut by_chair: HashMap<Uuid, i64> = HashMap::new();
    for ride in store.completed_rides_for_chairs(&chair_ids, since, until) {
        if let Some(chair_id) = ride.chair_id {
            *by_chair.entry(chair_id).or_default() += fares.fare(&ride);
        }
    }

    let mut by_model: BTreeMap<String, i64> = BTreeMap::new();
    let chairs: Vec<ChairSales> = chairs
        .into_iter()
        .map(|chair| {
            let sales = by_chair.get(&chair.id).copied().unwrap_or(0);
            *by_model.entry(chair.model).or_default() += sales;
            ChairSales {
                id: chair.id,
                name: chair.name,
                sales,
            }
        })
        .collect();

    SalesReport {
        total_sales: chairs.iter().map(|chair| chair.sales).sum(),
        chairs,
        models: by_model
            .into_iter()
            .map(|(model, sales)| ModelSales { model, sales })
            .collect(),
    }
}

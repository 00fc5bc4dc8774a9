use std::collections::HashMap;

use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use tracing::{info, warn};

use shared::models::{NewOrder, NewOrderItem, OrderStatus};
use shared::schema::{order_items, orders, products};
use shared::OrderError;

#[derive(Debug, Clone, Deserialize)]
pub struct ItemRequest {
    pub product_id: i64,
    pub quantity: i32,
}

/// Reserves inventory for one order inside a single transaction.
///
/// Either a new PENDING order with its line items exists and every referenced
/// product's inventory is decremented, or nothing changed at all. Product rows
/// are locked in ascending id order so two concurrent reservations that share
/// products can never deadlock; repeated identical calls create distinct
/// orders, there is no request-level deduplication.
pub async fn place_order(
    conn: &mut AsyncPgConnection,
    user_id: i64,
    items: Vec<ItemRequest>,
) -> Result<i64, OrderError> {
    validate(user_id, &items)?;
    let product_ids = lock_order(&items);

    conn.transaction::<i64, OrderError, _>(|conn| {
        Box::pin(async move {
            // Lock every involved product row, ascending by id.
            let locked: Vec<(i64, i32)> = products::table
                .filter(products::id.eq_any(&product_ids))
                .select((products::id, products::inventory))
                .order(products::id.asc())
                .for_update()
                .load(conn)
                .await?;
            let snapshot: HashMap<i64, i32> = locked.into_iter().collect();

            if let Some(product_id) = missing_product(&snapshot, &product_ids) {
                warn!(user_id, product_id, "order rejected, unknown product");
                return Err(OrderError::ProductNotFound { product_id });
            }

            if let Err(err) = plan_decrements(&snapshot, &items) {
                if let Some(product_id) = err.product_id() {
                    info!(user_id, product_id, "insufficient inventory");
                }
                return Err(err);
            }

            let order_id: i64 = diesel::insert_into(orders::table)
                .values(&NewOrder {
                    user_id,
                    status: OrderStatus::Pending.as_str().to_string(),
                })
                .returning(orders::id)
                .get_result(conn)
                .await?;

            for item in &items {
                // Guarded decrement. The row lock above already serializes
                // writers, so a zero row count here means the lock scope is
                // wrong somewhere; treat it as the race it would then be.
                let updated = diesel::update(
                    products::table
                        .filter(products::id.eq(item.product_id))
                        .filter(products::inventory.ge(item.quantity)),
                )
                .set(products::inventory.eq(products::inventory - item.quantity))
                .execute(conn)
                .await?;

                if updated != 1 {
                    warn!(
                        user_id,
                        order_id,
                        product_id = item.product_id,
                        quantity = item.quantity,
                        "insufficient inventory detected at write time"
                    );
                    return Err(OrderError::InsufficientInventory {
                        product_id: item.product_id,
                    });
                }

                diesel::insert_into(order_items::table)
                    .values(&NewOrderItem {
                        order_id,
                        product_id: item.product_id,
                        quantity: item.quantity,
                    })
                    .execute(conn)
                    .await?;
            }

            info!(order_id, user_id, item_count = items.len(), "order created");
            Ok(order_id)
        })
    })
    .await
}

fn validate(user_id: i64, items: &[ItemRequest]) -> Result<(), OrderError> {
    if user_id <= 0 || items.is_empty() {
        return Err(OrderError::InvalidRequest);
    }
    if items
        .iter()
        .any(|item| item.product_id <= 0 || item.quantity <= 0)
    {
        return Err(OrderError::InvalidItems);
    }
    Ok(())
}

/// Deduplicated product ids in ascending order. This fixed lock-acquisition
/// order is the deadlock-avoidance invariant: concurrent reservations that
/// overlap always take their shared locks in the same relative order.
fn lock_order(items: &[ItemRequest]) -> Vec<i64> {
    let mut ids: Vec<i64> = items.iter().map(|item| item.product_id).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

fn missing_product(snapshot: &HashMap<i64, i32>, product_ids: &[i64]) -> Option<i64> {
    product_ids
        .iter()
        .find(|id| !snapshot.contains_key(*id))
        .copied()
}

/// Replays the requested quantities against the locked snapshot, in input
/// order, accumulating across duplicate mentions of the same product.
fn plan_decrements(
    snapshot: &HashMap<i64, i32>,
    items: &[ItemRequest],
) -> Result<(), OrderError> {
    let mut remaining = snapshot.clone();
    for item in items {
        let current = remaining
            .get_mut(&item.product_id)
            .ok_or(OrderError::ProductNotFound {
                product_id: item.product_id,
            })?;
        if *current < item.quantity {
            return Err(OrderError::InsufficientInventory {
                product_id: item.product_id,
            });
        }
        *current -= item.quantity;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product_id: i64, quantity: i32) -> ItemRequest {
        ItemRequest {
            product_id,
            quantity,
        }
    }

    #[test]
    fn rejects_nonpositive_user() {
        assert!(matches!(
            validate(0, &[item(1, 1)]),
            Err(OrderError::InvalidRequest)
        ));
        assert!(matches!(
            validate(-3, &[item(1, 1)]),
            Err(OrderError::InvalidRequest)
        ));
    }

    #[test]
    fn rejects_empty_item_list() {
        assert!(matches!(validate(1, &[]), Err(OrderError::InvalidRequest)));
    }

    #[test]
    fn rejects_nonpositive_quantities_and_ids() {
        assert!(matches!(
            validate(1, &[item(1, 0)]),
            Err(OrderError::InvalidItems)
        ));
        assert!(matches!(
            validate(1, &[item(0, 2)]),
            Err(OrderError::InvalidItems)
        ));
        assert!(validate(1, &[item(1, 2)]).is_ok());
    }

    #[test]
    fn lock_order_sorts_and_dedups() {
        let items = [item(7, 1), item(3, 2), item(7, 4), item(1, 1)];
        assert_eq!(lock_order(&items), vec![1, 3, 7]);
    }

    #[test]
    fn missing_product_names_the_first_absent_id() {
        let snapshot = HashMap::from([(1, 5), (3, 2)]);
        assert_eq!(missing_product(&snapshot, &[1, 3]), None);
        assert_eq!(missing_product(&snapshot, &[1, 2, 999]), Some(2));
    }

    #[test]
    fn plan_allows_exact_drain_to_zero() {
        let snapshot = HashMap::from([(1, 5)]);
        assert!(plan_decrements(&snapshot, &[item(1, 5)]).is_ok());
    }

    #[test]
    fn plan_rejects_shortfall_and_names_product() {
        let snapshot = HashMap::from([(1, 5), (2, 10)]);
        let err = plan_decrements(&snapshot, &[item(2, 3), item(1, 6)]).unwrap_err();
        assert!(matches!(
            err,
            OrderError::InsufficientInventory { product_id: 1 }
        ));
    }

    #[test]
    fn plan_accumulates_duplicate_products() {
        // 3 + 3 against inventory 5 must fail even though each line fits.
        let snapshot = HashMap::from([(1, 5)]);
        let err = plan_decrements(&snapshot, &[item(1, 3), item(1, 3)]).unwrap_err();
        assert!(matches!(
            err,
            OrderError::InsufficientInventory { product_id: 1 }
        ));
    }
}

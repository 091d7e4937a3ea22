use crate::{
    config::AppConfig,
    entities::{cart, cart_item, coupon, Cart, CartItem, Coupon, Product, ProductVariant},
    errors::{CouponRejection, ServiceError},
    events::{Event, EventSender},
    services::coupons::CouponService,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Shopping cart service.
///
/// Carts are single-owner, so mutations need no cross-request locking:
/// each operation is one short transaction that ends by recomputing the
/// cached totals from the current lines. Those totals are display values;
/// the checkout transaction recomputes them again under lock and never
/// trusts them.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    config: Arc<AppConfig>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender, config: Arc<AppConfig>) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// Creates a cart owned by either a customer or a guest session.
    #[instrument(skip(self))]
    pub async fn create_cart(&self, input: CreateCartInput) -> Result<cart::Model, ServiceError> {
        if input.customer_id.is_some() == input.session_key.is_some() {
            return Err(ServiceError::ValidationError(
                "Cart must be owned by exactly one of customer_id or session_key".to_string(),
            ));
        }

        let now = Utc::now();
        let model = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(input.customer_id),
            session_key: Set(input.session_key),
            currency: Set(input.currency.unwrap_or_else(|| "VND".to_string())),
            coupon_id: Set(None),
            subtotal: Set(Decimal::ZERO),
            discount_total: Set(Decimal::ZERO),
            tax_total: Set(Decimal::ZERO),
            shipping_total: Set(Decimal::ZERO),
            total: Set(Decimal::ZERO),
            item_count: Set(0),
            status: Set(cart::CartStatus::Active),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let created = model.insert(&*self.db).await?;
        self.event_sender
            .send_or_log(Event::CartCreated(created.id))
            .await;

        info!(cart_id = %created.id, "Created cart");
        Ok(created)
    }

    /// Adds a line or bumps the quantity of an existing one. The unit
    /// price is snapshotted from the catalog at add time.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        input: AddItemInput,
    ) -> Result<cart::Model, ServiceError> {
        if input.quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let cart = active_cart(&txn, cart_id).await?;

        let product = Product::find_by_id(input.product_id)
            .one(&txn)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", input.product_id))
            })?;

        let variant = match input.variant_id {
            Some(variant_id) => {
                let variant = ProductVariant::find_by_id(variant_id)
                    .one(&txn)
                    .await?
                    .filter(|v| v.is_active && v.product_id == product.id)
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Variant {} not found", variant_id))
                    })?;
                Some(variant)
            }
            None => None,
        };

        let unit_price = variant.as_ref().map(|v| v.price).unwrap_or(product.price);

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(input.product_id))
            .filter(match input.variant_id {
                Some(id) => cart_item::Column::VariantId.eq(id),
                None => cart_item::Column::VariantId.is_null(),
            })
            .one(&txn)
            .await?;

        match existing {
            Some(item) => {
                let quantity = item.quantity + input.quantity;
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(quantity);
                item.line_total = Set(unit_price * Decimal::from(quantity));
                item.updated_at = Set(Utc::now());
                item.update(&txn).await?;
            }
            None => {
                let now = Utc::now();
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(input.product_id),
                    variant_id: Set(input.variant_id),
                    quantity: Set(input.quantity),
                    unit_price: Set(unit_price),
                    line_total: Set(unit_price * Decimal::from(input.quantity)),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }

        let updated = self.recalculate_totals(&txn, cart_id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id,
                product_id: input.product_id,
            })
            .await;

        Ok(updated)
    }

    /// Updates a line's quantity; zero or negative removes the line.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<cart::Model, ServiceError> {
        let txn = self.db.begin().await?;
        active_cart(&txn, cart_id).await?;

        let item = CartItem::find_by_id(item_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;

        if item.cart_id != cart_id {
            return Err(ServiceError::InvalidOperation(
                "Item does not belong to this cart".to_string(),
            ));
        }

        if quantity <= 0 {
            item.delete(&txn).await?;
        } else {
            let unit_price = item.unit_price;
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.line_total = Set(unit_price * Decimal::from(quantity));
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?;
        }

        let updated = self.recalculate_totals(&txn, cart_id).await?;
        txn.commit().await?;

        Ok(updated)
    }

    /// Removes a line outright.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        self.update_item_quantity(cart_id, item_id, 0).await
    }

    /// Attaches a coupon after an advisory validation pass. The
    /// authoritative validation happens again inside the checkout
    /// transaction, closing the window between attach and checkout.
    #[instrument(skip(self))]
    pub async fn apply_coupon(
        &self,
        cart_id: Uuid,
        code: &str,
        customer_id: Option<Uuid>,
    ) -> Result<cart::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let cart = active_cart(&txn, cart_id).await?;

        let normalized = code.trim().to_uppercase();
        let coupon = Coupon::find()
            .filter(coupon::Column::Code.eq(normalized))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::coupon(CouponRejection::NotFound))?;

        CouponService::check_window(&coupon, Utc::now())
            .map_err(ServiceError::coupon)?;

        if cart.subtotal < coupon.min_order_amount {
            return Err(ServiceError::coupon(CouponRejection::MinimumNotMet));
        }

        if let Some(customer_id) = customer_id {
            CouponService::check_user_limit(&txn, &coupon, customer_id).await?;
        }

        let coupon_id = coupon.id;
        let mut active: cart::ActiveModel = cart.into();
        active.coupon_id = Set(Some(coupon_id));
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;

        let updated = self.recalculate_totals(&txn, cart_id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartUpdated(cart_id)).await;
        Ok(updated)
    }

    /// Detaches the coupon.
    #[instrument(skip(self))]
    pub async fn remove_coupon(&self, cart_id: Uuid) -> Result<cart::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let cart = active_cart(&txn, cart_id).await?;

        let mut active: cart::ActiveModel = cart.into();
        active.coupon_id = Set(None);
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;

        let updated = self.recalculate_totals(&txn, cart_id).await?;
        txn.commit().await?;

        Ok(updated)
    }

    /// Removes every line and the coupon, leaving an empty active cart.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, cart_id: Uuid) -> Result<cart::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let cart = active_cart(&txn, cart_id).await?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await?;

        let mut active: cart::ActiveModel = cart.into();
        active.coupon_id = Set(None);
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;

        let updated = self.recalculate_totals(&txn, cart_id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartCleared(cart_id)).await;
        info!(cart_id = %cart_id, "Cleared cart");
        Ok(updated)
    }

    /// Folds a guest-session cart into the customer's cart at login.
    /// Combined quantities are capped at available stock rather than
    /// failing the merge. Both cart rows are locked in ascending-id order.
    #[instrument(skip(self))]
    pub async fn merge_guest_cart(
        &self,
        target_cart_id: Uuid,
        guest_cart_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        if target_cart_id == guest_cart_id {
            return Err(ServiceError::InvalidOperation(
                "Cannot merge a cart into itself".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let mut ids = [target_cart_id, guest_cart_id];
        ids.sort();
        let locked = Cart::find()
            .filter(cart::Column::Id.is_in(ids))
            .order_by_asc(cart::Column::Id)
            .lock_exclusive()
            .all(&txn)
            .await?;
        let target = locked
            .iter()
            .find(|c| c.id == target_cart_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", target_cart_id)))?;
        let guest = locked
            .iter()
            .find(|c| c.id == guest_cart_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", guest_cart_id)))?;

        if target.status != cart::CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }

        let guest_items = guest.find_related(CartItem).all(&txn).await?;

        for item in guest_items {
            let existing = CartItem::find()
                .filter(cart_item::Column::CartId.eq(target.id))
                .filter(cart_item::Column::ProductId.eq(item.product_id))
                .filter(match item.variant_id {
                    Some(id) => cart_item::Column::VariantId.eq(id),
                    None => cart_item::Column::VariantId.is_null(),
                })
                .one(&txn)
                .await?;

            match existing {
                Some(target_item) => {
                    let mut quantity = target_item.quantity + item.quantity;

                    if let Some(product) = Product::find_by_id(item.product_id).one(&txn).await? {
                        if product.track_inventory && !product.allow_backorder {
                            let available = match item.variant_id {
                                Some(variant_id) => ProductVariant::find_by_id(variant_id)
                                    .one(&txn)
                                    .await?
                                    .map(|v| v.stock_quantity)
                                    .unwrap_or(0),
                                None => product.stock_quantity,
                            };
                            if quantity > available {
                                info!(
                                    product_id = %item.product_id,
                                    requested = quantity,
                                    available,
                                    "Cart merge capped quantity at available stock"
                                );
                                quantity = available;
                            }
                        }
                    }

                    let unit_price = target_item.unit_price;
                    let mut target_item: cart_item::ActiveModel = target_item.into();
                    target_item.quantity = Set(quantity);
                    target_item.line_total = Set(unit_price * Decimal::from(quantity));
                    target_item.updated_at = Set(Utc::now());
                    target_item.update(&txn).await?;

                    item.delete(&txn).await?;
                }
                None => {
                    let mut item: cart_item::ActiveModel = item.into();
                    item.cart_id = Set(target.id);
                    item.updated_at = Set(Utc::now());
                    item.update(&txn).await?;
                }
            }
        }

        let mut guest: cart::ActiveModel = guest.into();
        guest.status = Set(cart::CartStatus::Abandoned);
        guest.updated_at = Set(Utc::now());
        guest.update(&txn).await?;

        let updated = self.recalculate_totals(&txn, target_cart_id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartsMerged {
                source_cart_id: guest_cart_id,
                target_cart_id,
            })
            .await;

        Ok(updated)
    }

    /// Fetches a cart with its lines.
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;
        let items = cart.find_related(CartItem).all(&*self.db).await?;
        Ok(CartWithItems { cart, items })
    }

    /// Recomputes every cached aggregate from the current lines plus the
    /// attached coupon's discount function.
    async fn recalculate_totals<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .all(conn)
            .await?;

        let subtotal: Decimal = items.iter().map(|item| item.line_total).sum();
        let item_count: i32 = items.iter().map(|item| item.quantity).sum();

        let mut discount = Decimal::ZERO;
        let mut free_shipping = false;
        if let Some(coupon_id) = cart.coupon_id {
            if let Some(coupon) = Coupon::find_by_id(coupon_id).one(conn).await? {
                let window_ok = CouponService::check_window(&coupon, Utc::now()).is_ok();
                if window_ok && subtotal >= coupon.min_order_amount {
                    discount = CouponService::calculate_discount(&coupon, subtotal);
                    free_shipping = CouponService::provides_free_shipping(&coupon);
                }
            }
        }

        let tax_rate = Decimal::from_f64_retain(self.config.checkout.tax_rate)
            .unwrap_or(Decimal::ZERO);
        let taxable = subtotal - discount;
        let tax = taxable * tax_rate;

        let shipping = if item_count == 0 || free_shipping {
            Decimal::ZERO
        } else {
            Decimal::from_f64_retain(self.config.checkout.shipping_flat_fee)
                .unwrap_or(Decimal::ZERO)
        };

        let total = subtotal - discount + tax + shipping;

        let mut active: cart::ActiveModel = cart.into();
        active.subtotal = Set(subtotal);
        active.discount_total = Set(discount);
        active.tax_total = Set(tax);
        active.shipping_total = Set(shipping);
        active.total = Set(total);
        active.item_count = Set(item_count);
        active.updated_at = Set(Utc::now());

        Ok(active.update(conn).await?)
    }
}

/// Loads a cart and rejects anything that is no longer active.
async fn active_cart<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<cart::Model, ServiceError> {
    let cart = Cart::find_by_id(cart_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

    if cart.status != cart::CartStatus::Active {
        return Err(ServiceError::InvalidOperation(
            "Cart is not active".to_string(),
        ));
    }

    Ok(cart)
}

/// Input for creating a cart
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateCartInput {
    pub customer_id: Option<Uuid>,
    pub session_key: Option<String>,
    pub currency: Option<String>,
}

/// Input for adding an item to a cart
#[derive(Debug, Deserialize)]
pub struct AddItemInput {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
}

/// Cart with its lines
#[derive(Debug, Serialize)]
pub struct CartWithItems {
    pub cart: cart::Model,
    pub items: Vec<cart_item::Model>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn owner_must_be_exactly_one_of_customer_or_session() {
        let both = CreateCartInput {
            customer_id: Some(Uuid::new_v4()),
            session_key: Some("sess".into()),
            currency: None,
        };
        let neither = CreateCartInput {
            customer_id: None,
            session_key: None,
            currency: None,
        };
        assert!(both.customer_id.is_some() == both.session_key.is_some());
        assert!(neither.customer_id.is_some() == neither.session_key.is_some());
    }

    #[test]
    fn line_total_scales_with_quantity() {
        let unit_price = dec!(100000);
        let quantity = 3;
        assert_eq!(unit_price * Decimal::from(quantity), dec!(300000));
    }

    #[test]
    fn taxable_amount_excludes_discount() {
        let subtotal = dec!(200000);
        let discount = dec!(20000);
        let tax_rate = dec!(0.10);
        let tax = (subtotal - discount) * tax_rate;
        assert_eq!(tax, dec!(18000.0));
    }

    #[test]
    fn total_combines_all_components() {
        let subtotal = dec!(200000);
        let discount = dec!(20000);
        let tax = dec!(18000);
        let shipping = dec!(30000);
        assert_eq!(subtotal - discount + tax + shipping, dec!(228000));
    }

    #[test]
    fn add_item_input_deserializes_without_variant() {
        let json = r#"{
            "product_id": "550e8400-e29b-41d4-a716-446655440000",
            "quantity": 2
        }"#;
        let input: AddItemInput = serde_json::from_str(json).expect("deserialize");
        assert_eq!(input.quantity, 2);
        assert!(input.variant_id.is_none());
    }
}

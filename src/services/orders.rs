use crate::{
    config::AppConfig,
    entities::{
        cart, cart_item, order, order_item, order_status_history, payment, refund, Cart, CartItem,
        Order, OrderItem, Payment,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        coupons::CouponService,
        inventory::{InventoryService, LineRequirement},
    },
};
use chrono::Utc;
use rand::{rngs::OsRng, Rng};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Characters used in externally visible number suffixes.
const NUMBER_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generates an order number with a cryptographically random suffix so
/// order identifiers cannot be guessed or enumerated.
/// Format: `ORD{yymmdd}{6 alphanumerics}`, e.g. `ORD250309A3B5C9`.
pub fn generate_order_number() -> String {
    let date_part = Utc::now().format("%y%m%d");
    let mut rng = OsRng;
    let suffix: String = (0..6)
        .map(|_| NUMBER_ALPHABET[rng.gen_range(0..NUMBER_ALPHABET.len())] as char)
        .collect();
    format!("ORD{}{}", date_part, suffix)
}

/// Shipping address snapshot captured into the order at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, utoipa::ToSchema)]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 20))]
    pub phone: String,
    #[validate(length(min = 1))]
    pub address_line: String,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 100))]
    pub country: String,
}

/// Checkout request. The caller is responsible for invoking this at most
/// once per checkout click (handlers enforce a client idempotency token).
#[derive(Debug, Deserialize, Validate, utoipa::ToSchema)]
pub struct CheckoutInput {
    pub cart_id: Uuid,
    pub customer_id: Uuid,
    #[validate(email)]
    pub email: String,
    #[validate]
    pub shipping: ShippingAddress,
    pub customer_note: Option<String>,
}

/// Order with its item snapshots.
#[derive(Debug, Serialize)]
pub struct OrderWithItems {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Converts carts into orders and owns every status transition that moves
/// inventory. All multi-row lock acquisition goes through
/// [`InventoryService::lock_lines`] so each path observes the same
/// ascending-id lock order.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    config: Arc<AppConfig>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender, config: Arc<AppConfig>) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// The order transaction: atomically converts a cart into an immutable
    /// order, decrementing inventory and redeeming the coupon.
    ///
    /// Everything happens inside one database transaction. Any failure,
    /// from insufficient stock to a constraint violation, rolls the whole
    /// thing back: no partial order, no partial decrement, no partial
    /// coupon increment can ever be observed.
    #[instrument(skip(self, input), fields(cart_id = %input.cart_id, customer_id = %input.customer_id))]
    pub async fn create_from_cart(
        &self,
        input: CheckoutInput,
    ) -> Result<OrderWithItems, ServiceError> {
        input.validate()?;

        let txn = self.db.begin().await?;

        let cart = Cart::find_by_id(input.cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", input.cart_id)))?;

        if cart.status != cart::CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }
        if let Some(owner) = cart.customer_id {
            if owner != input.customer_id {
                return Err(ServiceError::Unauthorized(
                    "Cart belongs to another customer".to_string(),
                ));
            }
        }

        let cart_items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .all(&txn)
            .await?;
        if cart_items.is_empty() {
            return Err(ServiceError::InvalidOperation("Cart is empty".to_string()));
        }

        // Lock every referenced inventory row in sorted order, then
        // re-read quantities under the lock. A competing checkout that won
        // the race has already decremented; we see the updated numbers.
        let lines = LineRequirement::from_cart_items(&cart_items);
        let locked = InventoryService::lock_lines(&txn, &lines).await?;
        InventoryService::check_availability(&locked, &lines)?;

        // Totals are recomputed from the lines; the cart's cached columns
        // are display values only.
        let subtotal: Decimal = cart_items.iter().map(|item| item.line_total).sum();

        let coupon = match cart.coupon_id {
            Some(coupon_id) => Some(
                CouponService::validate_for_checkout(&txn, coupon_id, input.customer_id, subtotal)
                    .await?,
            ),
            None => None,
        };

        let discount = coupon
            .as_ref()
            .map(|c| CouponService::calculate_discount(c, subtotal))
            .unwrap_or(Decimal::ZERO);
        let free_shipping = coupon
            .as_ref()
            .map(CouponService::provides_free_shipping)
            .unwrap_or(false);

        let tax_rate =
            Decimal::from_f64_retain(self.config.checkout.tax_rate).unwrap_or(Decimal::ZERO);
        let tax = (subtotal - discount) * tax_rate;
        let shipping = if free_shipping {
            Decimal::ZERO
        } else {
            Decimal::from_f64_retain(self.config.checkout.shipping_flat_fee)
                .unwrap_or(Decimal::ZERO)
        };
        let total = subtotal - discount + tax + shipping;

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number()),
            customer_id: Set(input.customer_id),
            email: Set(input.email.clone()),
            status: Set(order::OrderStatus::Pending),
            payment_status: Set(order::OrderPaymentStatus::Pending),
            currency: Set(cart.currency.clone()),
            subtotal: Set(subtotal),
            discount_total: Set(discount),
            shipping_total: Set(shipping),
            tax_total: Set(tax),
            total: Set(total),
            coupon_id: Set(coupon.as_ref().map(|c| c.id)),
            coupon_code: Set(coupon.as_ref().map(|c| c.code.clone())),
            shipping_name: Set(input.shipping.name.clone()),
            shipping_phone: Set(input.shipping.phone.clone()),
            shipping_address_line: Set(input.shipping.address_line.clone()),
            shipping_city: Set(input.shipping.city.clone()),
            shipping_country: Set(input.shipping.country.clone()),
            customer_note: Set(input.customer_note.clone()),
            paid_at: Set(None),
            shipped_at: Set(None),
            delivered_at: Set(None),
            completed_at: Set(None),
            cancelled_at: Set(None),
            cancellation_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        // Item snapshots: name/sku/commission from the locked catalog
        // rows, price from the cart line. These are never recalculated.
        let mut items = Vec::with_capacity(cart_items.len());
        for cart_line in &cart_items {
            let product = locked
                .products
                .get(&cart_line.product_id)
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", cart_line.product_id))
                })?;
            let variant_name = cart_line
                .variant_id
                .and_then(|id| locked.variants.get(&id))
                .map(|v| v.name.clone());
            let sku = cart_line
                .variant_id
                .and_then(|id| locked.variants.get(&id))
                .map(|v| v.sku.clone())
                .unwrap_or_else(|| product.sku.clone());

            let total_price = cart_line.line_total;
            let commission_amount = total_price * product.commission_rate;
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                vendor_id: Set(product.vendor_id),
                product_id: Set(cart_line.product_id),
                variant_id: Set(cart_line.variant_id),
                product_name: Set(product.name.clone()),
                product_sku: Set(sku),
                variant_name: Set(variant_name),
                quantity: Set(cart_line.quantity),
                unit_price: Set(cart_line.unit_price),
                total_price: Set(total_price),
                commission_rate: Set(product.commission_rate),
                commission_amount: Set(commission_amount),
                vendor_amount: Set(total_price - commission_amount),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        InventoryService::reserve(&txn, &locked, &lines).await?;

        if let Some(coupon) = &coupon {
            CouponService::redeem(&txn, coupon.id, input.customer_id, order_id, discount).await?;
        }

        // Clear the cart and retire it so a duplicate checkout submission
        // finds nothing to convert.
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        let mut cart_update: cart::ActiveModel = cart.into();
        cart_update.coupon_id = Set(None);
        cart_update.subtotal = Set(Decimal::ZERO);
        cart_update.discount_total = Set(Decimal::ZERO);
        cart_update.tax_total = Set(Decimal::ZERO);
        cart_update.shipping_total = Set(Decimal::ZERO);
        cart_update.total = Set(Decimal::ZERO);
        cart_update.item_count = Set(0);
        cart_update.status = Set(cart::CartStatus::Converted);
        cart_update.updated_at = Set(now);
        cart_update.update(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderCreated(order_id))
            .await;
        self.event_sender
            .send_or_log(Event::StockReserved {
                order_id,
                lines: lines.len(),
            })
            .await;
        if let Some(coupon) = &coupon {
            self.event_sender
                .send_or_log(Event::CouponRedeemed {
                    coupon_id: coupon.id,
                    order_id,
                    discount,
                })
                .await;
        }

        info!(order_id = %order_id, order_number = %order.order_number, total = %order.total, "Order created");
        Ok(OrderWithItems { order, items })
    }

    /// Cancels an order and restores its inventory, in one transaction.
    #[instrument(skip(self))]
    pub async fn cancel(&self, order_id: Uuid, reason: &str) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let (order, restored_lines) = self.cancel_within(&txn, order_id, reason).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderCancelled {
                order_id,
                reason: reason.to_string(),
            })
            .await;
        self.event_sender
            .send_or_log(Event::StockRestored {
                order_id,
                lines: restored_lines,
            })
            .await;

        info!(order_id = %order_id, reason = %reason, "Order cancelled");
        Ok(order)
    }

    /// Cancellation body, callable from inside another transaction (the
    /// payment-failure path joins it to its own payment update).
    ///
    /// The status guard runs inside the same lock scope that performs the
    /// restoration, so a second cancel of the same order (a redelivered
    /// webhook, or the sweep racing a manual cancel) reads `cancelled`
    /// and refuses, making double restoration impossible.
    pub(crate) async fn cancel_within<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        reason: &str,
    ) -> Result<(order::Model, usize), ServiceError> {
        let order = Order::find()
            .filter(order::Column::Id.eq(order_id))
            .lock_exclusive()
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !order.status.can_cancel() {
            return Err(ServiceError::OrderNotCancellable {
                order_id,
                status: order.status.to_string(),
            });
        }

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(conn)
            .await?;

        let lines = LineRequirement::from_order_items(&items);
        let locked = InventoryService::lock_lines(conn, &lines).await?;
        InventoryService::restore(conn, &locked, &lines).await?;

        let old_status = order.status;
        let now = Utc::now();
        let mut active: order::ActiveModel = order.into();
        active.status = Set(order::OrderStatus::Cancelled);
        active.cancelled_at = Set(Some(now));
        active.cancellation_reason = Set(Some(reason.to_string()));
        active.updated_at = Set(now);
        let updated = active.update(conn).await?;

        record_status_change(conn, order_id, old_status, order::OrderStatus::Cancelled, reason)
            .await?;

        Ok((updated, lines.len()))
    }

    /// Refunds a paid order: restores inventory, flips the completed
    /// payment to refunded, and writes a refund audit row.
    #[instrument(skip(self))]
    pub async fn refund(&self, order_id: Uuid, reason: &str) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find()
            .filter(order::Column::Id.eq(order_id))
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !order.status.can_refund() {
            return Err(ServiceError::OrderNotRefundable {
                order_id,
                status: order.status.to_string(),
            });
        }

        let completed_payment = Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.eq(payment::PaymentStatus::Completed))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidOperation(format!(
                    "Order {} has no completed payment to refund",
                    order_id
                ))
            })?;

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        let lines = LineRequirement::from_order_items(&items);
        let locked = InventoryService::lock_lines(&txn, &lines).await?;
        InventoryService::restore(&txn, &locked, &lines).await?;

        let now = Utc::now();
        let amount = order.total;
        let old_status = order.status;

        let mut payment_update: payment::ActiveModel = completed_payment.clone().into();
        payment_update.status = Set(payment::PaymentStatus::Refunded);
        payment_update.updated_at = Set(now);
        payment_update.update(&txn).await?;

        refund::ActiveModel {
            id: Set(Uuid::new_v4()),
            refund_number: Set(generate_refund_number()),
            payment_id: Set(completed_payment.id),
            order_id: Set(order_id),
            amount: Set(amount),
            reason: Set(reason.to_string()),
            status: Set(refund::RefundStatus::Completed),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut active: order::ActiveModel = order.into();
        active.status = Set(order::OrderStatus::Refunded);
        active.payment_status = Set(order::OrderPaymentStatus::Refunded);
        active.updated_at = Set(now);
        let updated = active.update(&txn).await?;

        record_status_change(&txn, order_id, old_status, order::OrderStatus::Refunded, reason)
            .await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderRefunded { order_id, amount })
            .await;
        self.event_sender
            .send_or_log(Event::StockRestored {
                order_id,
                lines: lines.len(),
            })
            .await;

        info!(order_id = %order_id, amount = %amount, "Order refunded");
        Ok(updated)
    }

    /// Manual fulfilment transitions (processing/shipped/delivered/
    /// completed) with their timestamp bookkeeping and history trail.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: order::OrderStatus,
        note: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        if matches!(
            new_status,
            order::OrderStatus::Cancelled | order::OrderStatus::Refunded
        ) {
            return Err(ServiceError::InvalidOperation(
                "Use the cancel/refund operations for inventory-restoring transitions".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let order = Order::find()
            .filter(order::Column::Id.eq(order_id))
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status;
        let now = Utc::now();
        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status);
        match new_status {
            order::OrderStatus::Paid => {
                active.paid_at = Set(Some(now));
                active.payment_status = Set(order::OrderPaymentStatus::Paid);
            }
            order::OrderStatus::Shipped => active.shipped_at = Set(Some(now)),
            order::OrderStatus::Delivered => active.delivered_at = Set(Some(now)),
            order::OrderStatus::Completed => active.completed_at = Set(Some(now)),
            _ => {}
        }
        active.updated_at = Set(now);
        let updated = active.update(&txn).await?;

        record_status_change(
            &txn,
            order_id,
            old_status,
            new_status,
            note.as_deref().unwrap_or(""),
        )
        .await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        Ok(updated)
    }

    /// Fetches an order with its item snapshots.
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(OrderWithItems { order, items })
    }
}

/// Appends one status-history row.
pub(crate) async fn record_status_change<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    old_status: order::OrderStatus,
    new_status: order::OrderStatus,
    note: &str,
) -> Result<(), ServiceError> {
    order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        old_status: Set(old_status.to_string()),
        new_status: Set(new_status.to_string()),
        note: Set(if note.is_empty() {
            None
        } else {
            Some(note.to_string())
        }),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;
    Ok(())
}

fn generate_refund_number() -> String {
    let date_part = Utc::now().format("%y%m%d");
    let mut rng = OsRng;
    let suffix: String = (0..6)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect();
    format!("REF{}{}", date_part, suffix)
}

pub mod cart;
pub mod cart_item;
pub mod coupon;
pub mod coupon_usage;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod payment;
pub mod payment_method;
pub mod product;
pub mod product_variant;
pub mod refund;

pub use cart::Entity as Cart;
pub use cart_item::Entity as CartItem;
pub use coupon::Entity as Coupon;
pub use coupon_usage::Entity as CouponUsage;
pub use order::Entity as Order;
pub use order_item::Entity as OrderItem;
pub use order_status_history::Entity as OrderStatusHistory;
pub use payment::Entity as Payment;
pub use payment_method::Entity as PaymentMethod;
pub use product::Entity as Product;
pub use product_variant::Entity as ProductVariant;
pub use refund::Entity as Refund;

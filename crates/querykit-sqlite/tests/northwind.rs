//! End-to-end tests over a small Northwind database.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use querykit_core::{
    Bindings, ColumnMapping, DbQueryType, EntityMapping, EntityPolicy, EntityProvider, Error, Expr,
    FromObject, Lambda, Mapping, Object, ProviderConfig, Record, Relationship, Result, SqlType,
    ToRecord, Value,
};
use querykit_sqlite::{create_table, open_provider, SqliteConfig, SqliteDriver};

const CUSTOMERS: &[(&str, &str, &str, &str)] = &[
    ("ALFKI", "Maria Anders", "Berlin", "Germany"),
    ("AROUT", "Thomas Hardy", "London", "UK"),
    ("BSBEV", "Victoria Ashworth", "London", "UK"),
    ("EASTC", "Ann Devon", "London", "UK"),
    ("PARIS", "Marie Bertrand", "Paris", "France"),
];

/// Orders 1..=20, owned round-robin by the first four customers.
const ORDER_COUNT: i32 = 20;

fn northwind() -> Mapping {
    let text = |length| DbQueryType::new(SqlType::NVarChar).with_length(length);
    let key = || DbQueryType::new(SqlType::NChar).with_length(5);
    Mapping::new()
        .with_entity(
            EntityMapping::new("Customer", "Customers")
                .with_column(ColumnMapping::new("CustomerID", key()).primary_key())
                .with_column(ColumnMapping::new("ContactName", text(30)))
                .with_column(ColumnMapping::new("City", text(15)))
                .with_column(ColumnMapping::new("Country", text(15)))
                .with_relationship(Relationship::one_to_many(
                    "Orders",
                    "Order",
                    &[("CustomerID", "CustomerID")],
                )),
        )
        .with_entity(
            EntityMapping::new("Order", "Orders")
                .with_column(
                    ColumnMapping::new("OrderID", DbQueryType::new(SqlType::Int))
                        .primary_key()
                        .generated(),
                )
                .with_column(ColumnMapping::new("CustomerID", key()))
                .with_column(ColumnMapping::new("OrderDate", DbQueryType::new(SqlType::DateTime)))
                .with_column(ColumnMapping::new("Freight", DbQueryType::new(SqlType::Float)))
                .with_relationship(Relationship::many_to_one(
                    "Customer",
                    "Customer",
                    &[("CustomerID", "CustomerID")],
                )),
        )
}

#[derive(Debug, Clone, PartialEq)]
struct Customer {
    id: String,
    name: String,
    city: String,
    country: String,
    orders: Vec<Order>,
}

impl FromObject for Customer {
    fn from_object(object: Object) -> Result<Self> {
        let record = Record::from_object(object)?;
        let orders = match record.field("Orders") {
            Some(Object::List(_)) => record.get("Orders")?,
            _ => Vec::new(),
        };
        Ok(Self {
            id: record.get("CustomerID")?,
            name: record.get("ContactName")?,
            city: record.get("City")?,
            country: record.get("Country")?,
            orders,
        })
    }
}

impl ToRecord for Customer {
    fn to_record(&self) -> Record {
        Record::new("Customer")
            .with("CustomerID", self.id.as_str())
            .with("ContactName", self.name.as_str())
            .with("City", self.city.as_str())
            .with("Country", self.country.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Order {
    id: Option<i32>,
    customer: String,
    date: String,
    freight: f64,
}

impl FromObject for Order {
    fn from_object(object: Object) -> Result<Self> {
        let record = Record::from_object(object)?;
        Ok(Self {
            id: record.get("OrderID")?,
            customer: record.get("CustomerID")?,
            date: record.get("OrderDate")?,
            freight: record.get("Freight")?,
        })
    }
}

impl ToRecord for Order {
    fn to_record(&self) -> Record {
        let record = Record::new("Order")
            .with("CustomerID", self.customer.as_str())
            .with("OrderDate", self.date.as_str())
            .with("Freight", self.freight);
        match self.id {
            Some(id) => record.with("OrderID", id),
            None => record,
        }
    }
}

struct TestContext {
    provider: EntityProvider<SqliteDriver>,
    _dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self::with(|config| config, EntityPolicy::new())
    }

    fn with(configure: impl FnOnce(SqliteConfig) -> SqliteConfig, policy: EntityPolicy) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = configure(SqliteConfig::new(dir.path().join("northwind.db3")));
        let provider = open_provider(config, northwind()).with_policy(policy);
        seed(&provider);
        Self { provider, _dir: dir }
    }

    fn including(deferred: bool) -> Self {
        let mut policy = EntityPolicy::new();
        policy
            .include(&northwind(), "Customer", "Orders", deferred)
            .unwrap();
        Self::with(|config| config, policy)
    }
}

fn seed<D: querykit_core::Driver>(provider: &EntityProvider<D>) {
    let mapping = northwind();
    let mut script = String::new();
    for entity in mapping.entities() {
        script.push_str(&create_table(entity));
        script.push_str(";\n");
    }
    for (id, name, city, country) in CUSTOMERS {
        script.push_str(&format!(
            "INSERT INTO Customers VALUES ('{}', '{}', '{}', '{}');\n",
            id, name, city, country
        ));
    }
    for i in 1..=ORDER_COUNT {
        let (customer, ..) = CUSTOMERS[(i as usize - 1) % 4];
        script.push_str(&format!(
            "INSERT INTO Orders(CustomerID, OrderDate, Freight) VALUES ('{}', '1997-01-{:02}', {}.5);\n",
            customer, i, i
        ));
    }
    provider.execute_command(&script).unwrap();
}

fn customer(c: &str) -> Expr {
    Expr::param(c)
}

fn customers_in(city: &str) -> Expr {
    Expr::table("Customer").filter(Lambda::new("c", customer("c").member("City").equals(city)))
}

fn order_ids(objects: Vec<Object>) -> Vec<i32> {
    objects
        .into_iter()
        .map(|o| Order::from_object(o).unwrap().id.unwrap())
        .collect()
}

#[test]
fn test_where_is_parameterized() {
    let ctx = TestContext::new();
    let text = ctx
        .provider
        .get_query_text(&customers_in("London"), &Bindings::new())
        .unwrap();
    assert!(text.contains("FROM Customers"));
    assert!(text.contains("@p0"));
    assert!(!text.contains("London"));

    let customers: Vec<Customer> = ctx
        .provider
        .query(&customers_in("London"), &Bindings::new())
        .unwrap();
    let ids: Vec<&str> = customers.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["AROUT", "BSBEV", "EASTC"]);
    assert!(customers.iter().all(|c| c.orders.is_empty()));
}

#[test]
fn test_captured_variable_is_a_parameter() {
    let ctx = TestContext::new();
    let query = Expr::table("Customer").filter(Lambda::new(
        "c",
        customer("c").member("Country").equals(Expr::var("country")),
    ));
    let found = ctx
        .provider
        .execute(&query, &Bindings::new().with("country", "Germany"))
        .unwrap();
    assert_eq!(found.len(), 1);
}

fn paged_orders(skip: i32, take: i32) -> Expr {
    Expr::table("Order")
        .order_by(Lambda::new("o", Expr::param("o").member("OrderID")))
        .skip(skip)
        .take(take)
}

#[test]
fn test_skip_take_native_offset() {
    let ctx = TestContext::new();
    let text = ctx
        .provider
        .get_query_text(&paged_orders(5, 10), &Bindings::new())
        .unwrap();
    assert_eq!(text.matches("LIMIT").count(), 1);
    assert_eq!(text.matches("OFFSET").count(), 1);

    let orders = ctx.provider.execute(&paged_orders(5, 10), &Bindings::new()).unwrap();
    assert_eq!(order_ids(orders), (6..=15).collect::<Vec<_>>());
}

#[test]
fn test_skip_take_row_number_emulation() {
    let ctx = TestContext::with(SqliteConfig::with_emulated_offset, EntityPolicy::new());
    let text = ctx
        .provider
        .get_query_text(&paged_orders(5, 10), &Bindings::new())
        .unwrap();
    assert!(text.contains("ROW_NUMBER() OVER"));
    assert!(text.contains("BETWEEN"));
    assert!(!text.contains("OFFSET"));
    assert!(!text.contains("LIMIT"));

    let orders = ctx.provider.execute(&paged_orders(5, 10), &Bindings::new()).unwrap();
    assert_eq!(order_ids(orders), (6..=15).collect::<Vec<_>>());
}

#[test]
fn test_include_loads_orders_with_one_batch() {
    let ctx = TestContext::including(false);
    let plan = ctx
        .provider
        .get_query_plan(&Expr::table("Customer"), &Bindings::new())
        .unwrap();
    assert!(plan.contains("client join"));

    let customers: Vec<Customer> = ctx
        .provider
        .query(&Expr::table("Customer"), &Bindings::new())
        .unwrap();
    assert_eq!(customers.len(), CUSTOMERS.len());
    for customer in &customers {
        let expected = if customer.id == "PARIS" { 0 } else { 5 };
        assert_eq!(customer.orders.len(), expected, "orders of {}", customer.id);
        assert!(customer.orders.iter().all(|o| o.customer == customer.id));
    }
    assert_eq!(ctx.provider.prepared_commands(), 2);
}

#[test]
fn test_deferred_include_loads_on_demand() {
    let ctx = TestContext::including(true);
    let alfki = ctx
        .provider
        .get_by_id("Customer", &[Value::from("ALFKI")])
        .unwrap();
    let record = alfki.as_record().unwrap();
    let deferred = match record.field("Orders") {
        Some(Object::Deferred(deferred)) => deferred.clone(),
        other => panic!("expected deferred orders, got {:?}", other),
    };

    let orders = ctx.provider.load_deferred(&deferred).unwrap();
    let orders: Vec<Order> = orders.into_typed().unwrap();
    assert_eq!(orders.len(), 5);
    assert!(orders.iter().all(|o| o.customer == "ALFKI"));
}

#[test]
fn test_singleton_navigation_keeps_every_order() {
    let ctx = TestContext::new();
    ctx.provider
        .execute_command(
            "INSERT INTO Orders(CustomerID, OrderDate, Freight) VALUES ('NOONE', '1997-02-01', 1.0)",
        )
        .unwrap();

    let query = Expr::table("Order").select(Lambda::new(
        "o",
        Expr::param("o").member("Customer").member("City"),
    ));
    let cities: Vec<Option<String>> = ctx.provider.query(&query, &Bindings::new()).unwrap();
    assert_eq!(cities.len(), ORDER_COUNT as usize + 1);
    assert_eq!(cities.iter().filter(|c| c.is_none()).count(), 1);
    assert_eq!(cities.iter().filter(|c| c.as_deref() == Some("Berlin")).count(), 5);

    let orphan = Expr::table("Order")
        .filter(Lambda::new("o", Expr::param("o").member("CustomerID").equals("NOONE")))
        .select(Lambda::new("o", Expr::param("o").member("Customer")))
        .single();
    let customer = ctx.provider.execute_scalar(&orphan, &Bindings::new()).unwrap();
    assert!(customer.is_null());
}

#[test]
fn test_aggregates() {
    let ctx = TestContext::new();
    let count = ctx
        .provider
        .execute_scalar(&Expr::table("Order").count(), &Bindings::new())
        .unwrap();
    assert_eq!(count.as_value().and_then(Value::as_i64), Some(ORDER_COUNT as i64));

    let any_paris = customers_in("Paris").any();
    let found = ctx.provider.execute_scalar(&any_paris, &Bindings::new()).unwrap();
    assert_eq!(found, Object::Value(Value::Bool(true)));

    let any_rome = customers_in("Rome").any();
    let found = ctx.provider.execute_scalar(&any_rome, &Bindings::new()).unwrap();
    assert_eq!(found, Object::Value(Value::Bool(false)));
}

#[test]
fn test_get_by_id() {
    let ctx = TestContext::new();
    let found = ctx
        .provider
        .get_by_id("Order", &[Value::Int32(3)])
        .unwrap();
    let order = Order::from_object(found).unwrap();
    assert_eq!(order.id, Some(3));
    assert_eq!(order.customer, "BSBEV");
    assert_eq!(order.freight, 3.5);

    assert!(ctx.provider.get_by_id("Order", &[Value::Int32(99)]).unwrap().is_null());
}

#[test]
fn test_insert_returns_generated_key() {
    let ctx = TestContext::new();
    let order = Order {
        id: None,
        customer: "PARIS".into(),
        date: "1998-05-01".into(),
        freight: 12.0,
    };
    let selector = Lambda::new("o", Expr::param("o").member("OrderID"));
    let id = ctx.provider.insert("Order", &order, Some(&selector)).unwrap();
    assert_eq!(id, Object::Value(Value::Int32(ORDER_COUNT + 1)));

    let stored = ctx.provider.get_by_id("Order", &[Value::Int32(ORDER_COUNT + 1)]).unwrap();
    assert_eq!(Order::from_object(stored).unwrap().customer, "PARIS");
}

#[test]
fn test_update_with_check() {
    let ctx = TestContext::new();
    let moved = Customer {
        id: "ALFKI".into(),
        name: "Maria Anders".into(),
        city: "Hamburg".into(),
        country: "Germany".into(),
        orders: Vec::new(),
    };
    let in_london = Lambda::new("c", customer("c").member("City").equals("London"));
    let city = Lambda::new("c", customer("c").member("City"));

    let rejected = ctx
        .provider
        .update("Customer", &moved, Some(&in_london), Some(&city))
        .unwrap();
    assert!(rejected.is_null());

    let in_berlin = Lambda::new("c", customer("c").member("City").equals("Berlin"));
    let updated = ctx
        .provider
        .update("Customer", &moved, Some(&in_berlin), Some(&city))
        .unwrap();
    assert_eq!(updated, Object::Value(Value::from("Hamburg")));
}

#[test]
fn test_insert_or_update_and_delete() {
    let ctx = TestContext::new();
    let mut newco = Customer {
        id: "NEWCO".into(),
        name: "New Owner".into(),
        city: "Oslo".into(),
        country: "Norway".into(),
        orders: Vec::new(),
    };
    ctx.provider.insert_or_update("Customer", &newco, None, None).unwrap();
    newco.city = "Bergen".into();
    ctx.provider.insert_or_update("Customer", &newco, None, None).unwrap();

    let stored: Customer = ctx
        .provider
        .get_by_id("Customer", &[Value::from("NEWCO")])
        .unwrap()
        .into_typed()
        .unwrap();
    assert_eq!(stored, newco);

    let deleted = ctx.provider.delete("Customer", &newco, None).unwrap();
    assert_eq!(deleted, Object::Value(Value::Int64(1)));
    assert!(ctx.provider.get_by_id("Customer", &[Value::from("NEWCO")]).unwrap().is_null());
}

#[test]
fn test_batch_insert_reuses_one_command() {
    let ctx = TestContext::new();
    let orders: Vec<Order> = (0..3)
        .map(|i| Order {
            id: None,
            customer: "PARIS".into(),
            date: format!("1998-06-0{}", i + 1),
            freight: i as f64,
        })
        .collect();

    let results = ctx.provider.batch_insert("Order", &orders, None).unwrap();
    assert!(!results.is_streamed());
    let affected: Vec<Object> = results.collect::<Result<_>>().unwrap();
    assert_eq!(affected, vec![Object::Value(Value::Int64(1)); 3]);
    assert_eq!(ctx.provider.prepared_commands(), 1);

    let count = Expr::table("Order")
        .filter(Lambda::new("o", Expr::param("o").member("CustomerID").equals("PARIS")))
        .count();
    let count = ctx.provider.execute_scalar(&count, &Bindings::new()).unwrap();
    assert_eq!(count.as_value().and_then(Value::as_i64), Some(3));
}

#[test]
fn test_failed_transaction_rolls_back() {
    let ctx = TestContext::new();
    let order = Order {
        id: None,
        customer: "PARIS".into(),
        date: "1998-07-01".into(),
        freight: 1.0,
    };
    let result: Result<()> = ctx.provider.do_transacted(|| {
        ctx.provider.insert("Order", &order, None)?;
        Err(Error::evaluation("abandon"))
    });
    assert!(result.is_err());

    let count = ctx
        .provider
        .execute_scalar(&Expr::table("Order").count(), &Bindings::new())
        .unwrap();
    assert_eq!(count.as_value().and_then(Value::as_i64), Some(ORDER_COUNT as i64));
}

#[tokio::test]
async fn test_async_operations() {
    let ctx = TestContext::new();
    let provider = Arc::new(ctx.provider);

    let london = Arc::clone(&provider)
        .execute_async(customers_in("London"), Bindings::new())
        .await
        .unwrap();
    assert_eq!(london.len(), 3);

    let order = Order {
        id: None,
        customer: "EASTC".into(),
        date: "1998-08-01".into(),
        freight: 4.0,
    };
    let inserted = Arc::clone(&provider)
        .insert_async("Order".into(), order.to_record(), None)
        .await
        .unwrap();
    assert_eq!(inserted, Object::Value(Value::Int64(1)));
}

// Row numbers and LIMIT/OFFSET must agree with slicing the ordered sequence.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_paging_matches_slicing(skip in 0i32..25, take in 0i32..25, emulate in any::<bool>()) {
        let config = if emulate {
            SqliteConfig::in_memory().with_emulated_offset()
        } else {
            SqliteConfig::in_memory()
        };
        let provider = open_provider(config, northwind());
        seed(&provider);

        let ids = order_ids(provider.execute(&paged_orders(skip, take), &Bindings::new()).unwrap());
        let expected: Vec<i32> = (1..=ORDER_COUNT).skip(skip as usize).take(take as usize).collect();
        prop_assert_eq!(ids, expected);
    }
}

#[test]
fn test_command_log_config() {
    let config = ProviderConfig::new().with_command_log().with_client_join_batch_size(2);
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut policy = EntityPolicy::new();
    policy.include(&northwind(), "Customer", "Orders", false).unwrap();

    let provider = open_provider(SqliteConfig::in_memory(), northwind())
        .with_policy(policy)
        .with_config(config);
    seed(&provider);

    let customers: Vec<Customer> = provider.query(&Expr::table("Customer"), &Bindings::new()).unwrap();
    let orders: usize = customers.iter().map(|c| c.orders.len()).sum();
    assert_eq!(orders, ORDER_COUNT as usize);
}

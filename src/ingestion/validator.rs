use std::collections::BTreeMap;

use serde::Serialize;

use super::OrderRequest;

/// Field-keyed validation messages, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, String>);

impl ValidationErrors {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Accumulates every failed check; the first message recorded for a key wins.
#[derive(Debug, Default)]
pub struct Validator {
    errors: BTreeMap<String, String>,
}

impl Validator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ok: bool, key: impl Into<String>, message: &str) {
        if !ok {
            self.add_error(key, message);
        }
    }

    pub fn add_error(&mut self, key: impl Into<String>, message: &str) {
        self.errors
            .entry(key.into())
            .or_insert_with(|| message.to_string());
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// # Errors
    /// Returns the accumulated messages when any check failed.
    pub fn finish(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(self.errors))
        }
    }
}

/// Checks every field of an order request, reporting all violations at once.
///
/// # Errors
/// Returns one message per offending field.
pub fn validate_order(request: &OrderRequest) -> Result<(), ValidationErrors> {
    let mut v = Validator::new();

    v.check(
        !request.customer_id.trim().is_empty(),
        "customer_id",
        "must be provided",
    );
    v.check(
        request.total_amount.is_finite() && request.total_amount >= 0.0,
        "total_amount",
        "must be zero or positive",
    );

    for (i, item) in request.items.iter().enumerate() {
        v.check(
            !item.sku.trim().is_empty(),
            format!("items[{i}].sku"),
            "sku must be provided",
        );
        v.check(
            item.qty > 0,
            format!("items[{i}].qty"),
            "quantity must be greater than zero",
        );
    }

    v.finish()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::ingestion::OrderItemRequest;

    fn request(customer_id: &str, total_amount: f64, items: &[(&str, i32)]) -> OrderRequest {
        OrderRequest {
            customer_id: customer_id.to_string(),
            total_amount,
            items: items
                .iter()
                .map(|(sku, qty)| OrderItemRequest {
                    sku: (*sku).to_string(),
                    qty: *qty,
                })
                .collect(),
        }
    }

    #[rstest]
    #[case::valid(request("cust-1", 10.0, &[("X", 2)]), &[])]
    #[case::zero_total_no_items(request("cust-1", 0.0, &[]), &[])]
    #[case::blank_customer(request("  ", 1.0, &[]), &["customer_id"])]
    #[case::negative_total(request("cust-1", -0.01, &[]), &["total_amount"])]
    #[case::two_fields(request("", -1.0, &[]), &["customer_id", "total_amount"])]
    #[case::bad_items(
        request("cust-1", 1.0, &[("A", 1), ("", 0)]),
        &["items[1].qty", "items[1].sku"]
    )]
    #[case::negative_qty(request("cust-1", 1.0, &[("A", -3)]), &["items[0].qty"])]
    fn validate_order_reports_every_violation(
        #[case] input: OrderRequest,
        #[case] expected: &[&str],
    ) {
        let keys: Vec<String> = match validate_order(&input) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.keys().map(str::to_string).collect(),
        };

        assert_eq!(keys, expected);
    }

    #[test]
    fn first_message_per_key_wins() {
        let mut v = Validator::new();
        v.add_error("customer_id", "must be provided");
        v.add_error("customer_id", "something else");

        let errors = v.finish().expect_err("has errors");

        assert_eq!(errors.len(), 1);
        assert_eq!(errors.get("customer_id"), Some("must be provided"));
    }

    #[test]
    fn errors_serialize_as_flat_map() {
        let errors = validate_order(&request("", 1.0, &[])).expect_err("invalid");

        let json = serde_json::to_value(&errors).expect("serialize");

        assert_eq!(json, serde_json::json!({"customer_id": "must be provided"}));
    }
}

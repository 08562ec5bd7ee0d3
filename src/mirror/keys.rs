//! Mirror Key Layout
//!
//! Every durable value lives under the `mirror:` namespace, with a set per
//! category indexing the member keys for rehydration.

pub struct MirrorKey;

impl MirrorKey {
    pub fn pair(id: &uuid::Uuid) -> String {
        format!("mirror:pair:{}", id)
    }

    pub fn pairs_index() -> &'static str {
        "mirror:pairs"
    }

    pub fn order(id: &uuid::Uuid) -> String {
        format!("mirror:order:{}", id)
    }

    pub fn orders_index() -> &'static str {
        "mirror:orders"
    }

    pub fn balance(trader: &str) -> String {
        format!("mirror:balance:{}", trader)
    }

    pub fn balances_index() -> &'static str {
        "mirror:balances"
    }

    pub fn market(symbol: &str) -> String {
        format!("mirror:market:{}", symbol)
    }

    pub fn markets_index() -> &'static str {
        "mirror:markets"
    }

    pub fn settlement(id: &uuid::Uuid) -> String {
        format!("mirror:slog:{}", id)
    }

    pub fn settlements_index() -> &'static str {
        "mirror:slog"
    }

    pub fn reconciled_event(id: &uuid::Uuid) -> String {
        format!("mirror:event:{}", id)
    }
}

//! Scanner definition table: which scanners exist, where they route, how
//! long they may run, and whether the suite survives their failure.

use std::time::Duration;

use crate::opportunity::SourceType;
use crate::provider::ProviderKind;

pub const OPTIONS_TIMEOUT: Duration = Duration::from_secs(90);
/// The stock scanner covers the whole universe in one call and is budgeted
/// accordingly.
pub const STOCK_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct ScannerDef {
    pub id: &'static str,
    pub label: &'static str,
    pub strategy_id: &'static str,
    pub route: &'static str,
    pub source_type: SourceType,
    pub provider: ProviderKind,
    pub timeout: Duration,
    /// Optional scanners fail soft: the suite records the error and moves on.
    pub optional: bool,
}

pub fn all_scanners() -> Vec<ScannerDef> {
    vec![
        ScannerDef {
            id: "stock_scanner",
            label: "Stock Scanner",
            strategy_id: "stock",
            route: "stock",
            source_type: SourceType::Stock,
            provider: ProviderKind::Finnhub,
            timeout: STOCK_TIMEOUT,
            optional: false,
        },
        ScannerDef {
            id: "credit_put",
            label: "Put Credit Spreads",
            strategy_id: "put_credit_spread",
            route: "credit/put",
            source_type: SourceType::Options,
            provider: ProviderKind::Tradier,
            timeout: OPTIONS_TIMEOUT,
            optional: true,
        },
        ScannerDef {
            id: "credit_call",
            label: "Call Credit Spreads",
            strategy_id: "call_credit_spread",
            route: "credit/call",
            source_type: SourceType::Options,
            provider: ProviderKind::Tradier,
            timeout: OPTIONS_TIMEOUT,
            optional: true,
        },
        ScannerDef {
            id: "iron_condor",
            label: "Iron Condors",
            strategy_id: "iron_condor",
            route: "condors",
            source_type: SourceType::Options,
            provider: ProviderKind::Tradier,
            timeout: OPTIONS_TIMEOUT,
            optional: true,
        },
        ScannerDef {
            id: "debit_spreads",
            label: "Debit Spreads",
            strategy_id: "debit_spread",
            route: "debit",
            source_type: SourceType::Options,
            provider: ProviderKind::Tradier,
            timeout: OPTIONS_TIMEOUT,
            optional: true,
        },
        ScannerDef {
            id: "butterflies",
            label: "Butterflies",
            strategy_id: "butterfly",
            route: "butterflies",
            source_type: SourceType::Options,
            provider: ProviderKind::Tradier,
            timeout: OPTIONS_TIMEOUT,
            optional: true,
        },
        ScannerDef {
            id: "income",
            label: "Income Strategies",
            strategy_id: "income",
            route: "income",
            source_type: SourceType::Options,
            provider: ProviderKind::Yahoo,
            timeout: OPTIONS_TIMEOUT,
            optional: true,
        },
        ScannerDef {
            id: "calendar",
            label: "Calendar Spreads",
            strategy_id: "calendar",
            route: "calendars",
            source_type: SourceType::Options,
            provider: ProviderKind::Yahoo,
            timeout: OPTIONS_TIMEOUT,
            optional: true,
        },
    ]
}

pub fn find_scanner(id: &str) -> Option<ScannerDef> {
    all_scanners().into_iter().find(|s| s.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_eight_scanners() {
        assert_eq!(all_scanners().len(), 8);
    }

    #[test]
    fn stock_scanner_is_first_and_critical() {
        let scanners = all_scanners();
        assert_eq!(scanners[0].id, "stock_scanner");
        assert_eq!(scanners[0].source_type, SourceType::Stock);
        assert!(!scanners[0].optional);
        assert_eq!(scanners[0].timeout, STOCK_TIMEOUT);
    }

    #[test]
    fn options_scanners_are_optional_with_options_timeout() {
        for s in all_scanners().iter().skip(1) {
            assert_eq!(s.source_type, SourceType::Options, "{}", s.id);
            assert!(s.optional, "{}", s.id);
            assert_eq!(s.timeout, OPTIONS_TIMEOUT, "{}", s.id);
        }
    }

    #[test]
    fn scanner_ids_are_unique() {
        let scanners = all_scanners();
        let mut ids: Vec<&str> = scanners.iter().map(|s| s.id).collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total, "Duplicate scanner ids found");
    }

    #[test]
    fn find_scanner_known_and_unknown() {
        assert!(find_scanner("iron_condor").is_some());
        assert!(find_scanner("nonexistent").is_none());
    }
}

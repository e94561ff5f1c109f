use super::*;

#[test]
fn test_category_of() {
    assert_eq!(category_of("account-123"), Some("account"));
    assert_eq!(category_of("account-123-456"), Some("account"));
    assert_eq!(category_of("nodash"), None);
    assert_eq!(category_of("-leading"), Some(""));
}

#[test]
fn test_all_filter_passes_everything() {
    let filter = EventFilter::all();
    assert!(filter.passes("anything-1", "AnyType"));
    assert!(filter.passes("nodash", "AnyType"));
}

#[test]
fn test_stream_filter() {
    let filter = EventFilter::from_streams(["ledger-1", "ledger-2"]);
    assert!(filter.passes_source("ledger-1"));
    assert!(filter.passes_source("ledger-2"));
    assert!(!filter.passes_source("ledger-3"));
    assert!(!filter.passes_source("other"));
}

#[test]
fn test_category_filter() {
    let filter = EventFilter::from_categories(["account"]);
    assert!(filter.passes_source("account-1"));
    assert!(filter.passes_source("account-abc-def"));
    assert!(!filter.passes_source("order-1"));
    assert!(!filter.passes_source("account"));
}

#[test]
fn test_event_type_restriction() {
    let filter = EventFilter::from_all_streams().with_event_types(["Deposited", "Withdrawn"]);
    assert!(filter.passes("account-1", "Deposited"));
    assert!(filter.passes("account-1", "Withdrawn"));
    assert!(!filter.passes("account-1", "Audited"));
}

#[test]
fn test_source_and_event_passes_compose() {
    let filter = EventFilter::from_categories(["account"]).with_event_types(["Deposited"]);
    assert!(filter.passes("account-1", "Deposited"));
    assert!(!filter.passes("order-1", "Deposited"));
    assert!(!filter.passes("account-1", "Audited"));
}

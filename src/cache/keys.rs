// Key factories per entity family.
// Callers build keys here instead of by hand so prefix invalidation stays correct.

use serde_json::Value;

use super::key::{QueryKey, Scope};

const LIST: &str = "list";
const DETAIL: &str = "detail";

/// Keys for an entity family with list and detail views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Family(Scope);

impl Family {
    /// Every cached key in the family.
    pub fn all(&self) -> QueryKey {
        QueryKey::new(self.0)
    }

    /// Prefix covering every list view regardless of filters.
    pub fn lists(&self) -> QueryKey {
        self.all().with(LIST)
    }

    /// A list view with the given filters. `Value::Null` means unfiltered.
    pub fn list(&self, filters: Value) -> QueryKey {
        self.lists().with(filters)
    }

    /// Prefix covering every detail record.
    pub fn details(&self) -> QueryKey {
        self.all().with(DETAIL)
    }

    pub fn detail(&self, id: &str) -> QueryKey {
        self.details().with(id)
    }
}

pub const OPPORTUNITIES: Family = Family(Scope::Opportunities);
pub const CONTACTS: Family = Family(Scope::Contacts);
pub const COMPANIES: Family = Family(Scope::Companies);
pub const EMAILS: Family = Family(Scope::Emails);
pub const MEETINGS: Family = Family(Scope::Meetings);
pub const BILLING: Family = Family(Scope::Billing);
pub const EVALUATIONS: Family = Family(Scope::Evaluations);

/// Derived aggregates.
pub mod dashboard {
    use super::*;

    pub fn all() -> QueryKey {
        QueryKey::new(Scope::Dashboard)
    }

    /// Opportunity totals grouped by stage.
    pub fn pipeline() -> QueryKey {
        all().with("pipeline")
    }

    /// Activity counts (emails, meetings) for an owner.
    pub fn activity(owner_id: &str) -> QueryKey {
        all().with("activity").with(owner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_family_prefixes_nest() {
        let detail = OPPORTUNITIES.detail("42");
        assert!(detail.starts_with(&OPPORTUNITIES.details()));
        assert!(detail.starts_with(&OPPORTUNITIES.all()));
        assert!(!detail.starts_with(&OPPORTUNITIES.lists()));

        let filtered = OPPORTUNITIES.list(json!({"stage": "open"}));
        assert!(filtered.starts_with(&OPPORTUNITIES.lists()));
        assert_ne!(filtered, OPPORTUNITIES.list(Value::Null));
    }

    #[test]
    fn test_families_are_disjoint() {
        assert!(!CONTACTS.detail("1").starts_with(&COMPANIES.all()));
        assert!(!EMAILS.lists().starts_with(&MEETINGS.all()));
        assert!(!dashboard::activity("u1").starts_with(&dashboard::pipeline()));
        assert!(dashboard::pipeline().starts_with(&dashboard::all()));
    }
}

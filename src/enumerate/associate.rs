//! Associator queries.
//!
//! A seed query selects instances of one class; each [`Association`] then
//! follows a property of the previous round's instances with
//! `ASSOCIATORS OF {Class.Property='value'}` queries:
//!
//! ```text
//! Select * from Win32_NetworkAdapter
//!   -> ASSOCIATORS of {Win32_NetworkAdapter.DeviceID='7'} WHERE ResultClass=Win32_PnPEntity
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EnumInfo, EnumerateClient};
use crate::error::Result;
use crate::response::Item;

/// One hop of an associator chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    /// Class whose instances are searched, e.g. `Win32_NetworkAdapter`
    pub search_class: String,
    /// Property of `search_class` used as the key, e.g. `DeviceID`
    pub search_property: String,
    /// Class returned by the association
    pub return_class: String,
    /// Association keyword: `AssocClass`, `RequiredAssocQualifier`,
    /// `RequiredQualifier`, `ResultClass`, `ResultRole` or `Role`
    pub where_type: String,
}

impl Association {
    pub fn new(
        search_class: impl Into<String>,
        search_property: impl Into<String>,
        return_class: impl Into<String>,
        where_type: impl Into<String>,
    ) -> Self {
        Self {
            search_class: search_class.into(),
            search_property: search_property.into(),
            return_class: return_class.into(),
            where_type: where_type.into(),
        }
    }

    /// The `ASSOCIATORS of` query for one key value.
    pub fn query(&self, value: &str) -> String {
        format!(
            "ASSOCIATORS of {{{}.{}='{}'}} WHERE {}={}",
            self.search_class, self.search_property, value, self.where_type, self.return_class
        )
    }
}

/// Seed instances plus, per return class, the associated instances keyed
/// by the search property value that produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssociationResults {
    pub seed: Vec<Item>,
    pub associations: IndexMap<String, IndexMap<String, Vec<Item>>>,
}

/// Enumerate client that follows associations.
#[derive(Debug, Clone)]
pub struct AssociatorClient {
    enumerate: EnumerateClient,
}

impl AssociatorClient {
    pub(crate) fn new(enumerate: EnumerateClient) -> Self {
        Self { enumerate }
    }

    pub fn enumerate_client(&self) -> &EnumerateClient {
        &self.enumerate
    }

    /// Run the seed query on `seed_class`, then each association in order,
    /// feeding every round's results into the next.
    pub async fn associate(
        &self,
        seed_class: &str,
        associations: &[Association],
        where_clause: Option<&str>,
        resource_uri: &str,
        fields: &[&str],
    ) -> Result<AssociationResults> {
        let fields = if fields.is_empty() {
            "*".to_string()
        } else {
            fields.join(",")
        };
        let mut wql = format!("Select {} from {}", fields, seed_class);
        if let Some(clause) = where_clause {
            wql.push_str(" where ");
            wql.push_str(clause);
        }

        let seed = self.collect_one(EnumInfo::with_resource_uri(wql, resource_uri)).await?;
        let mut results = AssociationResults {
            seed,
            associations: IndexMap::new(),
        };

        let mut input = results.seed.clone();
        for association in associations {
            let mut next_input = Vec::new();
            let mut by_value: IndexMap<String, Vec<Item>> = IndexMap::new();

            for item in &input {
                let Some(value) = item.get_str(&association.search_property) else {
                    continue;
                };
                let query = association.query(value);
                debug!(
                    host = %self.enumerate.conn_info().hostname,
                    query = %query,
                    "Following association"
                );
                let found = self
                    .collect_one(EnumInfo::with_resource_uri(query, resource_uri))
                    .await?;
                next_input.extend(found.iter().cloned());
                by_value.insert(value.to_string(), found);
            }

            results
                .associations
                .insert(association.return_class.clone(), by_value);
            input = next_input;
        }

        Ok(results)
    }

    async fn collect_one(&self, enum_info: EnumInfo) -> Result<Vec<Item>> {
        let mut collected = self.enumerate.do_collect(std::slice::from_ref(&enum_info)).await?;
        Ok(collected.swap_remove(&enum_info).unwrap_or_default())
    }
}

//! Serde mirrors for catalog persistence. The on-disk format is a single
//! BSON document: `{ namespaces: { "<db.coll>": { name, documents, indexes } } }`.

use std::collections::HashMap;
use std::sync::Arc;

use bson::Document;
use serde::{Deserialize, Serialize};

use doppio_bson::Doc;
use doppio_query::IndexConfig;

use crate::catalog::{Catalog, Namespace};
use crate::error::StoreError;

#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogPayload {
    pub namespaces: HashMap<String, NamespacePayload>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamespacePayload {
    pub name: String,
    pub documents: Vec<Document>,
    pub indexes: Vec<IndexPayload>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexPayload {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_filter: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_secs: Option<i64>,
}

impl CatalogPayload {
    pub fn from_catalog(catalog: &Catalog) -> CatalogPayload {
        let mut namespaces = HashMap::with_capacity(catalog.namespaces.len());
        for (name, ns) in catalog.namespaces.iter() {
            namespaces.insert(name.clone(), NamespacePayload::from_namespace(ns));
        }
        CatalogPayload { namespaces }
    }

    pub fn into_catalog(self) -> Result<Catalog, StoreError> {
        let mut catalog = Catalog::new();
        for (name, payload) in self.namespaces {
            let ns = payload.into_namespace()?;
            catalog.namespaces.insert(name, Arc::new(ns));
        }
        Ok(catalog)
    }
}

impl NamespacePayload {
    pub fn from_namespace(ns: &Namespace) -> NamespacePayload {
        NamespacePayload {
            name: ns.name().to_string(),
            documents: ns.documents().iter().map(|doc| Document::clone(doc)).collect(),
            indexes: ns
                .indexes()
                .iter()
                .map(|index| IndexPayload::from_config(index.config()))
                .collect(),
        }
    }

    fn into_namespace(self) -> Result<Namespace, StoreError> {
        let mut configs = Vec::with_capacity(self.indexes.len());
        for payload in self.indexes {
            configs.push(payload.into_config()?);
        }
        let documents: Vec<Doc> = self.documents.into_iter().map(Doc::new).collect();
        Ok(Namespace::prepare(self.name, documents, configs))
    }

    /// Serialized size of this namespace, reported by `listDatabases`.
    pub fn serialized_len(&self) -> u64 {
        bson::to_vec(self).map(|bytes| bytes.len() as u64).unwrap_or(0)
    }
}

impl IndexPayload {
    fn from_config(config: &IndexConfig) -> IndexPayload {
        IndexPayload {
            name: config.name.clone(),
            keys: config.keys_document(),
            unique: config.unique,
            partial_filter: config.partial_filter.clone(),
            expire_after_secs: config.expire_after_secs,
        }
    }

    fn into_config(self) -> Result<IndexConfig, StoreError> {
        let mut config = IndexConfig::from_keys(&self.keys)
            .map_err(|e| StoreError::Corrupt(format!("index '{}': {e}", self.name)))?;
        config.name = self.name;
        config.unique = self.unique;
        config.partial_filter = self.partial_filter;
        config.expire_after_secs = self.expire_after_secs;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn round_trip_preserves_documents_and_indexes() {
        let docs: Vec<Doc> = vec![
            Doc::new(doc! { "_id": 1, "email": "a@x" }),
            Doc::new(doc! { "_id": 2, "email": "b@x" }),
        ];
        let mut config = IndexConfig::from_keys(&doc! { "email": 1 }).unwrap();
        config.unique = true;
        let ns = Namespace::prepare("db.users".into(), docs, vec![config]);

        let mut catalog = Catalog::new();
        catalog
            .namespaces
            .insert("db.users".into(), Arc::new(ns));

        let bytes = bson::to_vec(&CatalogPayload::from_catalog(&catalog)).unwrap();
        let parsed: CatalogPayload = bson::from_slice(&bytes).unwrap();
        let restored = parsed.into_catalog().unwrap();

        let ns = restored.get("db.users").unwrap();
        assert_eq!(ns.documents().len(), 2);
        assert_eq!(ns.primary().len(), 2);
        assert_eq!(ns.indexes().len(), 1);
        assert_eq!(ns.indexes()[0].config().name, "email_1");
        assert!(ns.indexes()[0].config().unique);
        assert_eq!(
            ns.documents().list()[0].get_str("email").unwrap(),
            "a@x"
        );
    }
}

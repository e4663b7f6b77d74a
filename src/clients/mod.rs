// External collaborators (spec §6.4): ASN resolver, geo database, vulnerability
// catalog, embedding provider. Each is a single shared instance, safe for
// concurrent use, matching §5's "shared resources" model. `casparian_security`
// and `aegis-rpc` are the pack's precedent for reqwest-based external clients;
// no pack repo touches GeoIP or vector embeddings, so those two are picked for
// being the standard, narrowly-scoped crate/shape for their stated interfaces.

pub mod asn_resolver;
pub mod embedding;
pub mod geo_db;
pub mod vuln_catalog;

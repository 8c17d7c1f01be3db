//! Module containing structs generated from `proto/`

/// Protobuf definitions shared by the Loggregator ecosystem.
pub mod loggregator {
    /// The v2 envelope schema.
    pub mod v2 {
        #![allow(clippy::pedantic)]
        #![allow(missing_docs)]
        #![allow(unreachable_pub)]
        #![allow(dead_code)]
        include!("proto/loggregator.v2.rs");
    }
}

/// Protobuf definitions for the Log Cache API.
pub mod logcache {
    /// Log Cache API, v1. Only the ingress service is carried here.
    pub mod v1 {
        #![allow(clippy::pedantic)]
        #![allow(missing_docs)]
        #![allow(unreachable_pub)]
        #![allow(dead_code)]
        include!("proto/logcache.v1.rs");
    }
}

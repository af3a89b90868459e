//! Protobuf messages of the compact binary format.

/// A single weighted row.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireRow {
    #[prost(message, repeated, tag = "1")]
    pub values: ::prost::alloc::vec::Vec<WireValue>,
    #[prost(sint64, tag = "2")]
    pub weight: i64,
}
/// A single value of a row.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireValue {
    #[prost(oneof = "wire_value::Kind", tags = "1, 2, 3, 4, 5")]
    pub kind: ::core::option::Option<wire_value::Kind>,
}
/// Nested message and enum types in `WireValue`.
pub mod wire_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(bool, tag = "1")]
        Null(bool),
        #[prost(bool, tag = "2")]
        Bool(bool),
        #[prost(sint64, tag = "3")]
        Int(i64),
        #[prost(double, tag = "4")]
        Float(f64),
        #[prost(string, tag = "5")]
        Text(::prost::alloc::string::String),
    }
}

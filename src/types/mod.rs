//! 类型系统模块：定义准入管线使用的请求与信封类型。
//!
//! # Types Module
//!
//! Request-side types shared by every pipeline stage.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SubmitRequest`] | What a caller hands to `Gateway::submit` |
//! | [`RequestEnvelope`] | The keyed request owned by the pipeline for its lifetime |
//! | [`RequestParams`] | Order-independent sampling/control parameters |
//! | [`Priority`] | Caller-declared priority |

pub mod request;

pub use request::{
    Payload, Priority, RequestEnvelope, RequestParams, SubmitRequest, NON_SEMANTIC_PARAMS,
};

//! Protocol translation between the Anthropic Messages API and the AWS
//! Bedrock Converse API: wire types for both sides, model-id resolution, and
//! the request/response/stream translators that sit between them.

pub mod anthropic;
pub mod bedrock;
pub mod resolver;
pub mod translate;

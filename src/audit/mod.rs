//! 防篡改审计链模块
//! 哈希链、HMAC 签名与 Merkle 根的纯计算部分

pub mod chain;

//! Session and client behaviour against an in-process mock proxy.

mod subscription;

//! Device identity resolution: an external-collaborator boundary.
//!
//! This module is deliberately thin — a pure function from certificate bytes to
//! `(device_id, environment)`, with no retry policy, caching, or network access of its own. A
//! deployment that sources identity differently can swap this module out without touching
//! the socket layer or engine.

use x509_parser::oid_registry::Oid;
use x509_parser::prelude::*;

use crate::error::IdentityError;

/// `1.3.6.1.4.1.55338.0.0` — DeviceID, an ASN.1 string.
const DEVICE_ID_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 55338, 0, 0];
/// `1.3.6.1.4.1.55338.0.1` — Environment, an ASN.1 integer.
const ENVIRONMENT_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 55338, 0, 1];

/// Resolved device identity: a stable device id string and an environment selector used to
/// pick the control-plane hostname (see [`hostname_for_environment`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub environment: u8,
}

/// Extract the device id and environment from a PEM-encoded device certificate.
pub fn device_info(cert_pem: &[u8]) -> Result<DeviceIdentity, IdentityError> {
    let (_, pem) =
        parse_x509_pem(cert_pem).map_err(|e| IdentityError::Malformed(e.to_string()))?;
    let cert = pem.parse_x509().map_err(|e| IdentityError::Malformed(e.to_string()))?;

    let device_id_oid = Oid::from(DEVICE_ID_OID).expect("valid static oid arcs");
    let environment_oid = Oid::from(ENVIRONMENT_OID).expect("valid static oid arcs");

    let device_id_ext =
        cert.extensions().iter().find(|e| e.oid == device_id_oid).ok_or(IdentityError::MissingDeviceId)?;
    let environment_ext = cert
        .extensions()
        .iter()
        .find(|e| e.oid == environment_oid)
        .ok_or(IdentityError::MissingEnvironment)?;

    let device_id =
        der_as_string(device_id_ext.value).ok_or(IdentityError::BadDeviceId)?;
    let environment =
        der_as_u8(environment_ext.value).ok_or(IdentityError::BadEnvironment)?;

    Ok(DeviceIdentity { device_id, environment })
}

/// Control-plane hostname for a resolved environment selector.
pub fn hostname_for_environment(environment: u8) -> &'static str {
    match environment {
        0 => "api.smok.co",
        1 => "api.test.smok-serwis.pl",
        _ => "http-api",
    }
}

fn der_as_string(der: &[u8]) -> Option<String> {
    let (_, obj) = x509_parser::der_parser::der::parse_der(der).ok()?;
    obj.as_str().map(str::to_owned).ok()
}

fn der_as_u8(der: &[u8]) -> Option<u8> {
    let (_, obj) = x509_parser::der_parser::der::parse_der(der).ok()?;
    obj.as_u32().ok().and_then(|v| u8::try_from(v).ok())
}

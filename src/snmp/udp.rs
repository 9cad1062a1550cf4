//! SNMP over UDP, backed by the `snmp2` crate
//!
//! Every walk opens its own session. v1 walks a column with GETNEXT, v2c
//! and v3 with GETBULK. A column ends when the agent answers with an OID
//! outside of it, an exception value or an OID that does not increase.
//!
//! Sessions never time out on their own; the poll session bounds the whole
//! walk with the target timeout.

use std::net::SocketAddr;

use async_trait::async_trait;
use snmp2::{AsyncSession, Value, v3};
use tracing::{instrument, trace};

use super::oid::Oid;
use super::transport::{
    AuthProtocol, SnmpCredentials, SnmpTarget, SnmpTransport, SnmpValue, TransportError, V3Auth,
    VarBind,
};

const MAX_REPETITIONS: u32 = 25;

/// Requests per column before giving up on an agent that never ends a walk
const MAX_REQUESTS_PER_COLUMN: usize = 1000;

/// v1 error status at the end of the MIB view
const NO_SUCH_NAME: u32 = 2;

fn exception(e: impl std::fmt::Display) -> TransportError {
    TransportError::Exception(e.to_string())
}

/// SNMP v1/v2c/v3 transport over UDP
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransport;

impl UdpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SnmpTransport for UdpTransport {
    #[instrument(skip_all, fields(target = %target.ip, version = target.credentials.version()))]
    async fn walk(
        &self,
        target: &SnmpTarget,
        columns: &[Oid],
    ) -> Result<Vec<VarBind>, TransportError> {
        let mut session = open(target).await?;
        let bulk = !matches!(target.credentials, SnmpCredentials::V1 { .. });

        let mut varbinds = Vec::new();
        for column in columns {
            walk_column(&mut session, bulk, column, &mut varbinds).await?;
        }

        trace!("walk returned {} var-binds", varbinds.len());
        Ok(varbinds)
    }
}

async fn open(target: &SnmpTarget) -> Result<AsyncSession, TransportError> {
    let address = SocketAddr::new(target.ip, target.udp);

    match &target.credentials {
        SnmpCredentials::V1 { community } => AsyncSession::new_v1(address, community.as_bytes(), 0)
            .await
            .map_err(exception),
        SnmpCredentials::V2c { community } => {
            AsyncSession::new_v2c(address, community.as_bytes(), 0)
                .await
                .map_err(exception)
        }
        SnmpCredentials::V3 {
            user,
            auth,
            privacy,
        } => {
            let security = security(user, auth.as_ref(), privacy.as_deref());
            let mut session = AsyncSession::new_v3(address, 0, security)
                .await
                .map_err(exception)?;
            // engine discovery
            session.init().await.map_err(exception)?;
            Ok(session)
        }
    }
}

/// User-based security parameters; privacy is DES and needs authentication
fn security(user: &str, auth: Option<&V3Auth>, privacy: Option<&str>) -> v3::Security {
    let Some(auth) = auth else {
        return v3::Security::new(user.as_bytes(), b"").with_auth(v3::Auth::NoAuthNoPriv);
    };

    let protocol = match auth.protocol {
        AuthProtocol::Md5 => v3::AuthProtocol::Md5,
        AuthProtocol::Sha => v3::AuthProtocol::Sha1,
    };
    let level = match privacy {
        Some(passphrase) => v3::Auth::AuthPriv {
            cipher: v3::Cipher::Des,
            privacy_password: passphrase.as_bytes().to_vec(),
        },
        None => v3::Auth::AuthNoPriv,
    };

    v3::Security::new(user.as_bytes(), auth.passphrase.as_bytes())
        .with_auth_protocol(protocol)
        .with_auth(level)
}

async fn walk_column(
    session: &mut AsyncSession,
    bulk: bool,
    column: &Oid,
    out: &mut Vec<VarBind>,
) -> Result<(), TransportError> {
    let mut cursor = column.clone();

    for _ in 0..MAX_REQUESTS_PER_COLUMN {
        let request = to_snmp_oid(&cursor)?;
        let response = if bulk {
            session.getbulk(&[&request], 0, MAX_REPETITIONS).await
        } else {
            session.getnext(&request).await
        }
        .map_err(exception)?;

        match response.error_status {
            0 => {}
            NO_SUCH_NAME if !bulk => return Ok(()),
            status => return Err(exception(format!("agent answered with error status {status}"))),
        }

        let received: Vec<VarBind> = response
            .varbinds
            .map(|(oid, value)| {
                let oid = from_snmp_oid(&oid)
                    .ok_or_else(|| exception("agent returned an OID with oversized arcs"))?;
                Ok(VarBind::new(oid, from_snmp_value(value)))
            })
            .collect::<Result<_, TransportError>>()?;

        match advance(column, &cursor, received, out) {
            Some(next) => cursor = next,
            None => return Ok(()),
        }
    }

    trace!("column {column} still not exhausted, giving up");
    Ok(())
}

/// Keep the var-binds of one response that belong to `column`
///
/// Returns where to continue the walk, or `None` once the column is done.
fn advance(
    column: &Oid,
    cursor: &Oid,
    received: Vec<VarBind>,
    out: &mut Vec<VarBind>,
) -> Option<Oid> {
    let mut next: Option<Oid> = None;

    for varbind in received {
        let last = next.as_ref().unwrap_or(cursor);
        if !varbind.oid.starts_with(column.arcs())
            || varbind.value == SnmpValue::Null
            || varbind.oid <= *last
        {
            return None;
        }

        next = Some(varbind.oid.clone());
        out.push(varbind);
    }

    next
}

fn to_snmp_oid(oid: &Oid) -> Result<snmp2::Oid<'static>, TransportError> {
    let arcs: Vec<u64> = oid.arcs().iter().copied().map(u64::from).collect();
    snmp2::Oid::from(&arcs).map_err(|e| exception(format!("cannot encode {oid}: {e:?}")))
}

fn from_snmp_oid(oid: &snmp2::Oid<'_>) -> Option<Oid> {
    let arcs = oid
        .iter()?
        .map(u32::try_from)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    Some(Oid::new(&arcs))
}

/// Owned value; exceptions and types the snapshot has no use for become `Null`
fn from_snmp_value(value: Value<'_>) -> SnmpValue {
    match value {
        Value::Integer(v) => SnmpValue::Integer(v),
        Value::Counter32(v) => SnmpValue::Counter32(v),
        Value::Unsigned32(v) => SnmpValue::Gauge32(v),
        Value::Timeticks(v) => SnmpValue::TimeTicks(v),
        Value::Counter64(v) => SnmpValue::Counter64(v),
        Value::OctetString(bytes) => SnmpValue::OctetString(bytes.to_vec()),
        Value::IpAddress(octets) => SnmpValue::IpAddress(octets),
        Value::ObjectIdentifier(oid) => from_snmp_oid(&oid)
            .map(SnmpValue::ObjectId)
            .unwrap_or(SnmpValue::Null),
        _ => SnmpValue::Null,
    }
}

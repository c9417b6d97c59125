//! Windows Filtering Platform engine
//!
//! The session is opened with `FWPM_SESSION_FLAG_DYNAMIC`: every object it adds
//! is removed by the OS when the handle closes or the process exits.

use std::mem;
use std::ptr;

use uuid::Uuid;
use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::NetworkManagement::WindowsFilteringPlatform::{
    FwpmEngineClose0, FwpmEngineOpen0, FwpmFilterAdd0, FwpmFilterDeleteById0, FwpmSubLayerAdd0,
    FwpmSubLayerDeleteByKey0, FwpmTransactionAbort0, FwpmTransactionBegin0,
    FwpmTransactionCommit0, FWPM_CONDITION_IP_LOCAL_ADDRESS, FWPM_CONDITION_IP_REMOTE_ADDRESS,
    FWPM_FILTER0, FWPM_FILTER_CONDITION0, FWPM_LAYER_ALE_AUTH_CONNECT_V4, FWPM_SESSION0,
    FWPM_SESSION_FLAG_DYNAMIC, FWPM_SUBLAYER0, FWP_ACTION_BLOCK, FWP_ACTION_PERMIT,
    FWP_MATCH_EQUAL, FWP_UINT8, FWP_V4_ADDR_AND_MASK, FWP_V4_ADDR_MASK,
};

use crate::engine::FilterEngine;
use crate::error::{Error, Result};
use crate::rule::{Action, ConditionField, FirewallRule, Layer, MatchType, SubLayer};

/// NTLM authentication service for the local engine
const RPC_C_AUTHN_WINNT: u32 = 10;

/// Highest weight the engine accepts for an `FWP_UINT8` filter weight
const MAX_ENGINE_WEIGHT: u8 = 15;

/// Map a logical 0..=255 rule weight onto the engine's 0..=15 range
///
/// Monotonic, and keeps block-all (1), permit (100) and local-host permit
/// (110) in distinct buckets.
pub fn engine_weight(weight: u8) -> u8 {
    (weight / 8).min(MAX_ENGINE_WEIGHT)
}

fn guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn check(op: &'static str, status: u32) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(Error::platform(op, status))
    }
}

/// Dynamic-session handle to the WFP engine
pub struct WfpEngine {
    handle: HANDLE,
}

// SAFETY: the engine handle is owned exclusively and WFP calls may be made from
// any thread
unsafe impl Send for WfpEngine {}

impl WfpEngine {
    /// Open a dynamic engine session on the local machine
    pub fn open() -> Result<Self> {
        let name = wide("Ruhop Kill-Switch Session");
        let mut handle: HANDLE = ptr::null_mut();

        let status = unsafe {
            let mut session: FWPM_SESSION0 = mem::zeroed();
            session.displayData.name = name.as_ptr() as *mut u16;
            session.flags = FWPM_SESSION_FLAG_DYNAMIC;
            FwpmEngineOpen0(ptr::null(), RPC_C_AUTHN_WINNT, ptr::null(), &session, &mut handle)
        };
        check("FwpmEngineOpen0", status)?;

        log::info!("WFP engine opened (dynamic session)");
        Ok(Self { handle })
    }

    fn handle(&self) -> Result<HANDLE> {
        if self.handle.is_null() {
            Err(Error::EngineClosed)
        } else {
            Ok(self.handle)
        }
    }
}

impl FilterEngine for WfpEngine {
    fn begin_transaction(&mut self) -> Result<()> {
        let handle = self.handle()?;
        check("FwpmTransactionBegin0", unsafe { FwpmTransactionBegin0(handle, 0) })
    }

    fn commit_transaction(&mut self) -> Result<()> {
        let handle = self.handle()?;
        check("FwpmTransactionCommit0", unsafe { FwpmTransactionCommit0(handle) })
    }

    fn abort_transaction(&mut self) -> Result<()> {
        let handle = self.handle()?;
        check("FwpmTransactionAbort0", unsafe { FwpmTransactionAbort0(handle) })
    }

    fn add_sublayer(&mut self, sublayer: &SubLayer) -> Result<()> {
        let handle = self.handle()?;
        let name = wide(&sublayer.name);
        let description = wide(&sublayer.description);

        let status = unsafe {
            let mut raw: FWPM_SUBLAYER0 = mem::zeroed();
            raw.subLayerKey = guid(sublayer.key);
            raw.displayData.name = name.as_ptr() as *mut u16;
            raw.displayData.description = description.as_ptr() as *mut u16;
            raw.weight = sublayer.weight;
            FwpmSubLayerAdd0(handle, &raw, ptr::null_mut())
        };
        check("FwpmSubLayerAdd0", status)?;

        log::debug!("Added sublayer {} ({})", sublayer.key, sublayer.name);
        Ok(())
    }

    fn delete_sublayer(&mut self, key: Uuid) -> Result<()> {
        let handle = self.handle()?;
        let key = guid(key);
        check("FwpmSubLayerDeleteByKey0", unsafe {
            FwpmSubLayerDeleteByKey0(handle, &key)
        })
    }

    fn add_filter(&mut self, rule: &FirewallRule) -> Result<u64> {
        let handle = self.handle()?;
        let name = wide(&rule.name);
        let description = wide(&rule.description);

        // Host byte order for both address and mask
        let mut addr_mask = FWP_V4_ADDR_AND_MASK { addr: 0, mask: 0 };
        let mut id: u64 = 0;

        let status = unsafe {
            let mut condition: FWPM_FILTER_CONDITION0 = mem::zeroed();
            let mut filter: FWPM_FILTER0 = mem::zeroed();

            filter.filterKey = guid(rule.key);
            filter.displayData.name = name.as_ptr() as *mut u16;
            filter.displayData.description = description.as_ptr() as *mut u16;
            filter.layerKey = match rule.layer {
                Layer::AleAuthConnectV4 => FWPM_LAYER_ALE_AUTH_CONNECT_V4,
            };
            filter.subLayerKey = guid(rule.sublayer);
            filter.weight.r#type = FWP_UINT8;
            filter.weight.Anonymous.uint8 = engine_weight(rule.weight);
            filter.action.r#type = match rule.action {
                Action::Permit => FWP_ACTION_PERMIT,
                Action::Block => FWP_ACTION_BLOCK,
            };

            if let Some(c) = &rule.condition {
                addr_mask.addr = u32::from(c.value.network());
                addr_mask.mask = u32::from(c.value.netmask());

                condition.fieldKey = match c.field {
                    ConditionField::RemoteAddress => FWPM_CONDITION_IP_REMOTE_ADDRESS,
                    ConditionField::LocalAddress => FWPM_CONDITION_IP_LOCAL_ADDRESS,
                };
                condition.matchType = match c.match_type {
                    MatchType::Equal => FWP_MATCH_EQUAL,
                };
                condition.conditionValue.r#type = FWP_V4_ADDR_MASK;
                condition.conditionValue.Anonymous.v4AddrMask = &mut addr_mask;

                filter.numFilterConditions = 1;
                filter.filterCondition = &mut condition;
            }

            FwpmFilterAdd0(handle, &filter, ptr::null_mut(), &mut id)
        };
        check("FwpmFilterAdd0", status)?;

        Ok(id)
    }

    fn delete_filter(&mut self, id: u64) -> Result<()> {
        let handle = self.handle()?;
        check("FwpmFilterDeleteById0", unsafe { FwpmFilterDeleteById0(handle, id) })
    }

    fn close(&mut self) -> Result<()> {
        if self.handle.is_null() {
            return Ok(());
        }
        let handle = mem::replace(&mut self.handle, ptr::null_mut());
        check("FwpmEngineClose0", unsafe { FwpmEngineClose0(handle) })?;
        log::info!("WFP engine closed");
        Ok(())
    }
}

impl Drop for WfpEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close WFP engine: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{BLOCK_ALL_WEIGHT, LOCAL_HOST_PERMIT_WEIGHT, PERMIT_WEIGHT};

    #[test]
    fn test_engine_weight_preserves_order() {
        let block = engine_weight(BLOCK_ALL_WEIGHT);
        let permit = engine_weight(PERMIT_WEIGHT);
        let local = engine_weight(LOCAL_HOST_PERMIT_WEIGHT);
        assert!(block < permit && permit < local);
        assert!(local <= MAX_ENGINE_WEIGHT);
        assert_eq!(engine_weight(u8::MAX), MAX_ENGINE_WEIGHT);
    }

    #[test]
    fn test_guid_conversion() {
        let g = guid(SubLayer::DEFAULT_KEY);
        assert_eq!(g.data1, 0x5d2c7a3e);
        assert_eq!(g.data2, 0x8b14);
        assert_eq!(g.data3, 0x4f6a);
    }

    #[test]
    #[ignore = "requires administrator privileges"]
    fn test_privileged_dynamic_session() {
        let mut engine = WfpEngine::open().unwrap();
        engine.begin_transaction().unwrap();
        engine.add_sublayer(&SubLayer::default()).unwrap();
        engine.abort_transaction().unwrap();
        engine.close().unwrap();
        engine.close().unwrap();
    }
}

//! GATT link capability consumed by the transfer state machines.
//!
//! Discovery and connection management live outside this crate. A caller
//! hands the state machines something that can write a characteristic,
//! read one, and deliver notifications in order.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::LinkError;

pub const OTA_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc);
pub const OTA_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x87654321_4321_4321_4321_cba987654321);
pub const OTA_CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x11111111_2222_3333_4444_555555555555);
pub const OTA_STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0xaaaaaaaa_bbbb_cccc_dddd_eeeeeeeeeeee);
pub const OTA_BUILD_NUMBER_CHAR_UUID: Uuid =
    Uuid::from_u128(0x66666666_7777_8888_9999_000000000000);

pub const DATA_SERVICE_UUID: Uuid = Uuid::from_u128(0x22334455_6677_8899_aabb_ccddeeffffaa);
pub const DATA_CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x33445566_7788_99aa_bbcc_ddeeffaabbcc);
pub const DATA_TRANSFER_CHAR_UUID: Uuid = Uuid::from_u128(0x44556677_8899_aabb_ccdd_eeffaabbccdd);
pub const DATA_STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x55667788_99aa_bbcc_ddee_ffaabbccddee);

/// The characteristics the protocol touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Characteristic {
    OtaControl,
    OtaData,
    OtaStatus,
    OtaBuildNumber,
    DataControl,
    DataTransfer,
    DataStatus,
}

impl Characteristic {
    pub const ALL: [Characteristic; 7] = [
        Characteristic::OtaControl,
        Characteristic::OtaData,
        Characteristic::OtaStatus,
        Characteristic::OtaBuildNumber,
        Characteristic::DataControl,
        Characteristic::DataTransfer,
        Characteristic::DataStatus,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            Characteristic::OtaControl => OTA_CONTROL_CHAR_UUID,
            Characteristic::OtaData => OTA_DATA_CHAR_UUID,
            Characteristic::OtaStatus => OTA_STATUS_CHAR_UUID,
            Characteristic::OtaBuildNumber => OTA_BUILD_NUMBER_CHAR_UUID,
            Characteristic::DataControl => DATA_CONTROL_CHAR_UUID,
            Characteristic::DataTransfer => DATA_TRANSFER_CHAR_UUID,
            Characteristic::DataStatus => DATA_STATUS_CHAR_UUID,
        }
    }

    pub fn service_uuid(&self) -> Uuid {
        match self {
            Characteristic::OtaControl
            | Characteristic::OtaData
            | Characteristic::OtaStatus
            | Characteristic::OtaBuildNumber => OTA_SERVICE_UUID,
            Characteristic::DataControl
            | Characteristic::DataTransfer
            | Characteristic::DataStatus => DATA_SERVICE_UUID,
        }
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == *uuid)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Characteristic::OtaControl => "ota-control",
            Characteristic::OtaData => "ota-data",
            Characteristic::OtaStatus => "ota-status",
            Characteristic::OtaBuildNumber => "ota-build-number",
            Characteristic::DataControl => "data-control",
            Characteristic::DataTransfer => "data-transfer",
            Characteristic::DataStatus => "data-status",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Callback invoked with the payload of every notification.
pub type NotifyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A connected GATT link.
///
/// Notifications for one characteristic must be delivered in send order.
/// Subscribing again to the same characteristic replaces the handler.
#[allow(async_fn_in_trait)]
pub trait GattLink {
    async fn write(&self, characteristic: Characteristic, bytes: &[u8]) -> Result<(), LinkError>;

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, LinkError>;

    async fn subscribe(
        &self,
        characteristic: Characteristic,
        handler: NotifyHandler,
    ) -> Result<(), LinkError>;
}

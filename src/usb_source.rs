/*! Read the trace stream from a USB bulk endpoint.

Walks a table of known debug probes. Orbtrace devices describe their
trace interface in the configuration descriptor (vendor class 0xFF,
subclass 0x54), so the interface and endpoint are discovered; the older
probes use hard-coded values. Bulk reads run with a short timeout so the
feeder stays responsive, and a timeout is simply a quiet link.
*/
use std::time::Duration;

use log::{debug, info};
use rusb::{Device, DeviceHandle, GlobalContext};

use crate::source::{ByteSource, SourceRead};
use crate::{Error, Result};

const BULK_TIMEOUT: Duration = Duration::from_millis(10);

/// Interface class/subclass an Orbtrace uses to mark its trace channel.
const TRACE_IFACE_CLASS: u8 = 0xff;
const TRACE_IFACE_SUBCLASS: u8 = 0x54;

struct Probe {
    vid: u16,
    pid: u16,
    autodiscover: bool,
    iface: u8,
    ep: u8,
    name: &'static str,
}

/// Known trace-capable probes, tried in order.
const DEVICE_TABLE: &[Probe] = &[
    Probe {
        vid: 0x1209,
        pid: 0x3443,
        autodiscover: true,
        iface: 0,
        ep: 0x81,
        name: "Orbtrace",
    },
    Probe {
        vid: 0x1d50,
        pid: 0x6018,
        autodiscover: false,
        iface: 5,
        ep: 0x85,
        name: "Blackmagic Probe",
    },
    Probe {
        vid: 0x2b3e,
        pid: 0xc610,
        autodiscover: false,
        iface: 3,
        ep: 0x85,
        name: "Phywhisperer-UDT",
    },
];

struct OpenDevice {
    handle: DeviceHandle<GlobalContext>,
    iface: u8,
    ep: u8,
}

/// USB bulk ingest driver.
#[derive(Default)]
pub struct UsbSource {
    dev: Option<OpenDevice>,
}

impl UsbSource {
    /// Create a driver. No bus access happens yet.
    #[must_use]
    pub fn new() -> Self {
        Self { dev: None }
    }
}

impl ByteSource for UsbSource {
    fn name(&self) -> &'static str {
        "usb"
    }

    fn open(&mut self) -> Result<()> {
        for dev in rusb::devices()?.iter() {
            let Ok(desc) = dev.device_descriptor() else {
                continue;
            };
            let Some(probe) = DEVICE_TABLE.iter().find(|p| {
                p.vid == desc.vendor_id() && p.pid == desc.product_id()
            }) else {
                continue;
            };
            match open_device(&dev, probe) {
                Ok(open) => {
                    info!(
                        "Found {} ({:04x}:{:04x}), interface {} endpoint {:#04x}",
                        probe.name, probe.vid, probe.pid, open.iface, open.ep
                    );
                    self.dev = Some(open);
                    return Ok(());
                }
                Err(e) => {
                    // Maybe claimed by another process; try the next one.
                    debug!("{}: {e}", probe.name);
                }
            }
        }
        Err(Error::NoDevice)
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<SourceRead> {
        let Some(dev) = self.dev.as_ref() else {
            return Err(Error::Setup("usb source not open".into()));
        };
        match dev.handle.read_bulk(dev.ep, buf, BULK_TIMEOUT) {
            Ok(0) => Ok(SourceRead::Idle),
            Ok(n) => Ok(SourceRead::Data(n)),
            Err(rusb::Error::Timeout) => Ok(SourceRead::Idle),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        if let Some(mut dev) = self.dev.take() {
            let _ = dev.handle.release_interface(dev.iface);
        }
    }
}

fn open_device(dev: &Device<GlobalContext>, probe: &Probe) -> Result<OpenDevice> {
    let (iface, alt, ep, alt_count) = if probe.autodiscover {
        discover_trace_interface(dev)?
    } else {
        (probe.iface, 0, probe.ep, 1)
    };
    let mut handle = dev.open()?;
    let _ = handle.set_auto_detach_kernel_driver(true);
    handle.claim_interface(iface)?;
    if alt_count > 1 {
        handle.set_alternate_setting(iface, alt)?;
    }
    Ok(OpenDevice { handle, iface, ep })
}

/// Find the trace interface in the active configuration: vendor class,
/// subclass 0x54, protocol 0 or 1, exactly one endpoint. Returns
/// (interface, alternate setting, endpoint, alternate count).
fn discover_trace_interface(
    dev: &Device<GlobalContext>,
) -> Result<(u8, u8, u8, usize)> {
    let config = dev.active_config_descriptor()?;
    for interface in config.interfaces() {
        let alt_count = interface.descriptors().count();
        for d in interface.descriptors() {
            if d.class_code() == TRACE_IFACE_CLASS
                && d.sub_class_code() == TRACE_IFACE_SUBCLASS
                && (d.protocol_code() == 0x00 || d.protocol_code() == 0x01)
                && d.num_endpoints() == 1
            {
                let Some(ep) = d.endpoint_descriptors().next() else {
                    continue;
                };
                return Ok((
                    d.interface_number(),
                    d.setting_number(),
                    ep.address(),
                    alt_count,
                ));
            }
        }
    }
    Err(Error::NoDevice)
}

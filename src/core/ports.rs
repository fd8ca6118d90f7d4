//! Port allocation - Deterministic port and display assignment per instance slot

use serde::{Deserialize, Serialize};

/// Ports bound by a single emulator per control port (console + adb)
const CONTROL_PORT_WIDTH: u32 = 2;

/// Ports and display number owned by one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAssignment {
    /// Emulator console port; the adb port is `control_port + 1`
    pub control_port: u16,
    /// VNC port of the framebuffer server
    pub framebuffer_port: u16,
    /// WebSocket port of the web bridge
    pub bridge_port: u16,
    /// X display number of the virtual display
    pub display_number: u32,
}

impl PortAssignment {
    /// The adb serial of the emulator bound to this control port
    pub fn adb_serial(&self) -> String {
        format!("emulator-{}", self.control_port)
    }

    /// X display name, e.g. `:99`
    pub fn display_name(&self) -> String {
        format!(":{}", self.display_number)
    }

    /// noVNC URL served by the web bridge
    pub fn vnc_url(&self, host: &str) -> String {
        format!(
            "http://{host}:{port}/vnc.html?host={host}&port={port}&autoconnect=true&resize=scale",
            host = host,
            port = self.bridge_port
        )
    }
}

/// Bases and strides used to derive a [`PortAssignment`] from a slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLayout {
    pub control_base: u16,
    pub control_stride: u16,
    pub framebuffer_base: u16,
    pub framebuffer_stride: u16,
    pub bridge_base: u16,
    pub bridge_stride: u16,
    pub display_base: u32,
    pub display_stride: u32,
}

impl Default for PortLayout {
    fn default() -> Self {
        Self {
            control_base: 5554,
            control_stride: 2,
            framebuffer_base: 5900,
            framebuffer_stride: 1,
            bridge_base: 6080,
            bridge_stride: 1,
            display_base: 99,
            display_stride: 1,
        }
    }
}

impl PortLayout {
    /// Compute the assignment for slot `index`.
    ///
    /// Pure and deterministic. Callers keep `index` below [`PortLayout::capacity`],
    /// which is what makes distinct slots disjoint.
    pub fn allocate(&self, index: u32) -> PortAssignment {
        debug_assert!(index < self.capacity(), "slot {} exceeds layout capacity", index);
        PortAssignment {
            control_port: offset(self.control_base, self.control_stride, index) as u16,
            framebuffer_port: offset(self.framebuffer_base, self.framebuffer_stride, index) as u16,
            bridge_port: offset(self.bridge_base, self.bridge_stride, index) as u16,
            display_number: self.display_base + self.display_stride * index,
        }
    }

    /// Largest number of slots for which every allocated port range stays
    /// inside the port space and no two ranges overlap.
    pub fn capacity(&self) -> u32 {
        if self.control_stride < CONTROL_PORT_WIDTH as u16
            || self.framebuffer_stride == 0
            || self.bridge_stride == 0
            || self.display_stride == 0
        {
            return 0;
        }

        // fits() is monotonic in n, so binary search the boundary
        let (mut lo, mut hi) = (0u32, u16::MAX as u32 + 1);
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.fits(mid) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo
    }

    /// Check the layout's internal consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.control_stride < CONTROL_PORT_WIDTH as u16 {
            return Err(format!(
                "control_stride must be at least {} (console and adb ports)",
                CONTROL_PORT_WIDTH
            ));
        }
        if self.capacity() == 0 {
            return Err("port layout cannot host a single instance".to_string());
        }
        Ok(())
    }

    fn fits(&self, n: u32) -> bool {
        if n == 0 {
            return true;
        }
        let last = n - 1;
        let ranges = [
            (
                self.control_base as u32,
                offset(self.control_base, self.control_stride, last) + CONTROL_PORT_WIDTH - 1,
            ),
            (
                self.framebuffer_base as u32,
                offset(self.framebuffer_base, self.framebuffer_stride, last),
            ),
            (
                self.bridge_base as u32,
                offset(self.bridge_base, self.bridge_stride, last),
            ),
        ];

        if ranges.iter().any(|&(_, end)| end > u16::MAX as u32) {
            return false;
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.0 <= b.1 && b.0 <= a.1 {
                    return false;
                }
            }
        }
        self.display_stride
            .checked_mul(last)
            .and_then(|span| self.display_base.checked_add(span))
            .is_some()
    }
}

fn offset(base: u16, stride: u16, index: u32) -> u32 {
    base as u32 + stride as u32 * index
}

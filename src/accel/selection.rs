// Compute platform and device selection.
//
// wgpu has no notion of an OpenCL-style "platform", so adapters are grouped
// by PCI vendor: every adapter one vendor's driver exposes (across DX12 and
// Vulkan) forms one platform, in order of first appearance. Selection is
// kept free of live wgpu objects so the policy can be tested without a GPU.

use rustc_hash::FxHashMap;

use crate::config::{AcceleratorVendor, VENDOR_ID_AMD, VENDOR_ID_INTEL, VENDOR_ID_NVIDIA};

/// What selection needs to know about one enumerated adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSummary {
    pub name: String,
    pub vendor_id: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl AdapterSummary {
    pub fn from_info(info: &wgpu::AdapterInfo) -> Self {
        Self {
            name: info.name.clone(),
            vendor_id: info.vendor,
            device_type: info.device_type,
            backend: info.backend,
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(
            self.device_type,
            wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu
        )
    }
}

impl std::fmt::Display for AdapterSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({:?}, {:?}, vendor {:#06x})",
            self.name, self.backend, self.device_type, self.vendor_id
        )
    }
}

/// All adapters exposed by one vendor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputePlatform {
    pub vendor_id: u32,
    pub name: String,
    /// Indices into the original enumeration order.
    pub adapters: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformChoice {
    pub platform: usize,
    /// The preferred vendor was not found and the first platform was taken.
    pub degraded: bool,
}

pub fn vendor_display_name(vendor_id: u32) -> String {
    match vendor_id {
        VENDOR_ID_AMD => "Advanced Micro Devices".to_string(),
        VENDOR_ID_NVIDIA => "NVIDIA".to_string(),
        VENDOR_ID_INTEL => "Intel".to_string(),
        other => format!("vendor {other:#06x}"),
    }
}

pub fn group_platforms(adapters: &[AdapterSummary]) -> Vec<ComputePlatform> {
    let mut platforms: Vec<ComputePlatform> = Vec::new();
    let mut by_vendor: FxHashMap<u32, usize> = FxHashMap::default();

    for (index, adapter) in adapters.iter().enumerate() {
        let slot = *by_vendor.entry(adapter.vendor_id).or_insert_with(|| {
            platforms.push(ComputePlatform {
                vendor_id: adapter.vendor_id,
                name: vendor_display_name(adapter.vendor_id),
                adapters: Vec::new(),
            });
            platforms.len() - 1
        });
        platforms[slot].adapters.push(index);
    }
    platforms
}

/// Prefer the platform matching `preferred`, by vendor id or by any of its
/// adapter names; otherwise fall back to the first platform.
pub fn select_platform(
    platforms: &[ComputePlatform],
    adapters: &[AdapterSummary],
    preferred: AcceleratorVendor,
) -> Option<PlatformChoice> {
    if platforms.is_empty() {
        return None;
    }
    if preferred == AcceleratorVendor::Any {
        return Some(PlatformChoice {
            platform: 0,
            degraded: false,
        });
    }

    let matching = platforms.iter().position(|platform| {
        preferred.matches(platform.vendor_id, &platform.name)
            || platform
                .adapters
                .iter()
                .filter_map(|&i| adapters.get(i))
                .any(|adapter| preferred.matches(adapter.vendor_id, &adapter.name))
    });

    Some(match matching {
        Some(platform) => PlatformChoice {
            platform,
            degraded: false,
        },
        None => PlatformChoice {
            platform: 0,
            degraded: true,
        },
    })
}

/// First GPU-class adapter of the platform, as an enumeration index.
pub fn select_device(platform: &ComputePlatform, adapters: &[AdapterSummary]) -> Option<usize> {
    platform
        .adapters
        .iter()
        .copied()
        .find(|&i| adapters.get(i).is_some_and(AdapterSummary::is_gpu))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(name: &str, vendor_id: u32, device_type: wgpu::DeviceType) -> AdapterSummary {
        AdapterSummary {
            name: name.to_string(),
            vendor_id,
            device_type,
            backend: wgpu::Backend::Dx12,
        }
    }

    fn hybrid_laptop() -> Vec<AdapterSummary> {
        vec![
            adapter("NVIDIA GeForce RTX 4060 Laptop GPU", VENDOR_ID_NVIDIA, wgpu::DeviceType::DiscreteGpu),
            adapter("Microsoft Basic Render Driver", 0x1414, wgpu::DeviceType::Cpu),
            adapter("AMD Radeon(TM) 780M", VENDOR_ID_AMD, wgpu::DeviceType::IntegratedGpu),
            adapter("NVIDIA GeForce RTX 4060 Laptop GPU", VENDOR_ID_NVIDIA, wgpu::DeviceType::DiscreteGpu),
        ]
    }

    #[test]
    fn adapters_group_by_vendor_in_first_seen_order() {
        let adapters = hybrid_laptop();
        let platforms = group_platforms(&adapters);
        assert_eq!(platforms.len(), 3);
        assert_eq!(platforms[0].vendor_id, VENDOR_ID_NVIDIA);
        assert_eq!(platforms[0].adapters, vec![0, 3]);
        assert_eq!(platforms[1].vendor_id, 0x1414);
        assert_eq!(platforms[2].name, "Advanced Micro Devices");
        assert_eq!(platforms[2].adapters, vec![2]);
    }

    #[test]
    fn preferred_vendor_wins_over_enumeration_order() {
        let adapters = hybrid_laptop();
        let platforms = group_platforms(&adapters);
        let choice = select_platform(&platforms, &adapters, AcceleratorVendor::Amd);
        assert_eq!(
            choice,
            Some(PlatformChoice {
                platform: 2,
                degraded: false
            })
        );
        assert_eq!(select_device(&platforms[2], &adapters), Some(2));
    }

    #[test]
    fn missing_vendor_falls_back_to_first_platform_degraded() {
        let adapters = vec![
            adapter("Intel(R) UHD Graphics", VENDOR_ID_INTEL, wgpu::DeviceType::IntegratedGpu),
            adapter("NVIDIA GeForce GTX 1080", VENDOR_ID_NVIDIA, wgpu::DeviceType::DiscreteGpu),
        ];
        let platforms = group_platforms(&adapters);
        let choice = select_platform(&platforms, &adapters, AcceleratorVendor::Amd);
        assert_eq!(
            choice,
            Some(PlatformChoice {
                platform: 0,
                degraded: true
            })
        );
        assert_eq!(select_device(&platforms[0], &adapters), Some(0));
    }

    #[test]
    fn name_match_covers_unknown_vendor_ids() {
        let adapters = vec![
            adapter("NVIDIA GeForce GTX 1080", VENDOR_ID_NVIDIA, wgpu::DeviceType::DiscreteGpu),
            adapter("AMD Radeon RX 6600 (Vulkan)", 0, wgpu::DeviceType::DiscreteGpu),
        ];
        let platforms = group_platforms(&adapters);
        let choice = select_platform(&platforms, &adapters, AcceleratorVendor::Amd);
        assert_eq!(choice.map(|c| c.platform), Some(1));
    }

    #[test]
    fn platforms_without_gpu_class_devices_select_nothing() {
        let adapters = vec![adapter("Microsoft Basic Render Driver", 0x1414, wgpu::DeviceType::Cpu)];
        let platforms = group_platforms(&adapters);
        assert_eq!(select_device(&platforms[0], &adapters), None);
        assert!(select_platform(&[], &[], AcceleratorVendor::Amd).is_none());
    }
}

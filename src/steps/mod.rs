//! Built-in steps.
//!
//! | name                     | produces                      |
//! |--------------------------|-------------------------------|
//! | `kernel/chimera`         | config, kernel, symbols       |
//! | `initrd/booster`         | initrd                        |
//! | `initrd/mkinitcpio`      | initrd                        |
//! | `initrd/initramfs-tools` | initrd                        |
//! | `uki/ukify`              | uki                           |
//! | `signing/sbsigntools`    | signed copy of the input      |
//! | `signing/uefisign`       | signed copy of the input      |
//! | `layout/plain`           | installed files in `boot`     |
//! | `layout/bls-type-2`      | installed UKI in the ESP      |

pub mod initrd;
pub mod kernel;
pub mod layout;
pub mod signing;
pub mod uki;

use std::sync::Arc;

use crate::error::Result;
use crate::registry::Registry;

/// Register every built-in step.
pub fn register_all(registry: &mut Registry) -> Result<()> {
    registry.register(Arc::new(kernel::Chimera::default()))?;
    registry.register(Arc::new(initrd::Booster::default()))?;
    registry.register(Arc::new(initrd::Mkinitcpio::default()))?;
    registry.register(Arc::new(initrd::InitramfsTools::default()))?;
    registry.register(Arc::new(uki::Ukify::default()))?;
    registry.register(Arc::new(signing::Sbsigntools::default()))?;
    registry.register(Arc::new(signing::Uefisign::default()))?;
    registry.register(Arc::new(layout::Plain::default()))?;
    registry.register(Arc::new(layout::BlsType2::default()))?;
    Ok(())
}

use crate::errors::IpcError;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// gpiochip base files of the supported kernels, relative to the sysfs root
const GPIOCHIP_BASE_CANDIDATES: [&str; 3] = [
    "devices/platform/soc/1000000.pinctrl/gpio/gpiochip0/base",
    "devices/soc/1000000.pinctrl/gpio/gpiochip0/base",
    "devices/soc.0/1000000.pinctrl/gpio/gpiochip911/base",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    fn as_bytes(&self) -> &'static [u8] {
        match self {
            Level::Low => b"0",
            Level::High => b"1",
        }
    }
}

/// An output pin that can be driven high or low.
pub trait GpioPin: Send {
    fn set_level(&mut self, level: Level) -> io::Result<()>;

    /// Set the pin up again from scratch, then drive it to `level`.
    fn reopen(&mut self, level: Level) -> io::Result<()>;
}

/// Output pin driven through the legacy sysfs GPIO interface.
#[derive(Debug)]
pub struct SysfsGpio {
    root: PathBuf,
    pin: u32,
    value: Option<File>,
}

impl SysfsGpio {
    /// Export `pin` if needed, make it an output and drive it to `initial`.
    pub fn open(root: impl AsRef<Path>, pin: u32, initial: Level) -> io::Result<Self> {
        let mut gpio = Self {
            root: root.as_ref().to_path_buf(),
            pin,
            value: None,
        };
        gpio.setup(initial)?;
        Ok(gpio)
    }

    fn base_offset(&self) -> io::Result<u32> {
        for candidate in GPIOCHIP_BASE_CANDIDATES {
            let path = self.root.join(candidate);
            match fs::read_to_string(&path) {
                Ok(contents) => {
                    return contents.trim().parse().map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("unparsable gpiochip base in {}", path.display()),
                        )
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no gpiochip base found",
        ))
    }

    fn setup(&mut self, level: Level) -> io::Result<()> {
        self.value = None;

        let number = self.pin + self.base_offset()?;
        let class = self.root.join("class/gpio");
        let dir = class.join(format!("gpio{number}"));

        if !dir.exists() {
            tracing::debug!(number, "Exporting GPIO");
            fs::write(class.join("export"), number.to_string())?;
            if !dir.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("gpio{number} missing after export"),
                ));
            }
        }

        fs::write(dir.join("direction"), "out")?;
        let value = OpenOptions::new().write(true).open(dir.join("value"))?;
        value.write_all_at(level.as_bytes(), 0)?;
        self.value = Some(value);
        Ok(())
    }
}

impl GpioPin for SysfsGpio {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        match &self.value {
            Some(file) => file.write_all_at(level.as_bytes(), 0),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "GPIO not set up")),
        }
    }

    fn reopen(&mut self, level: Level) -> io::Result<()> {
        self.setup(level)
    }
}

/// Drives the sensor power-down line.
pub struct PowerController {
    pin: Box<dyn GpioPin>,
}

impl PowerController {
    pub fn new(pin: Box<dyn GpioPin>) -> Self {
        Self { pin }
    }

    /// Use the sysfs pin from the client configuration, starting out of
    /// standby.
    pub fn sysfs(root: impl AsRef<Path>, pin: u32) -> Result<Self, IpcError> {
        let gpio = SysfsGpio::open(root, pin, Level::Low).map_err(IpcError::Gpio)?;
        Ok(Self::new(Box::new(gpio)))
    }

    /// Put the sensor into standby (pin high) or wake it (pin low).
    ///
    /// The pin vanishes when a camera daemon crashes and unexports it, so a
    /// failed write sets the pin up again once before giving up. On error
    /// the camera is left in its previous state.
    pub fn set_standby(&mut self, standby: bool) -> Result<(), IpcError> {
        let level = if standby { Level::High } else { Level::Low };

        if let Err(e) = self.pin.set_level(level) {
            tracing::warn!(standby, error = %e, "Failed to set power-down GPIO, recreating");
            self.pin.reopen(level).map_err(|e| {
                tracing::error!(standby, error = %e, "Failed to recreate power-down GPIO");
                IpcError::Gpio(e)
            })?;
        }

        tracing::debug!(standby, "Camera standby updated");
        Ok(())
    }
}

impl std::fmt::Debug for PowerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerController").finish_non_exhaustive()
    }
}

//! Slow-control client: calibration registers, monitoring ADCs and GPIO.
//!
//! Every remote procedure is a single text request of the form
//! `"<name> <arg> <arg> ..."`. The procedures the server understands are
//! listed once in [`RPC_TABLE`]; [`SlowControlClient::invoke`] checks a call
//! against that table and the typed helpers are thin wrappers around it.

use super::{Connector, MessageClient};
use crate::config_tree::ConfigTree;
use crate::error::{AppResult, DaqError};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// GPIO lines driven during bring-up.
pub mod gpio {
    /// SiPM bias supply enable
    pub const BIAS_ENABLE: u32 = 1 << 0;
    /// LED system master enable
    pub const LED_MASTER_ENABLE: u32 = 1 << 1;
    /// First LED disable line (active high)
    pub const LED_DISABLE_1: u32 = 1 << 2;
    /// Second LED disable line (active high)
    pub const LED_DISABLE_2: u32 = 1 << 3;
    /// Lines configured as outputs before any value is written
    pub const BRING_UP_DIRECTION: u32 =
        BIAS_ENABLE | LED_MASTER_ENABLE | LED_DISABLE_1 | LED_DISABLE_2;
    /// Direction code for an output line
    pub const OUTPUT: i64 = 1;
}

/// ADC channel monitoring the bias of channel 1.
pub const BIAS_ADC_CHANNEL_1: u8 = 9;
/// ADC channel monitoring the bias of every other channel.
pub const BIAS_ADC_CHANNEL_OTHER: u8 = 10;

/// Expected shape of a procedure's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Free-form acknowledgement
    Ack,
    /// Integer (decimal or `0x` hex)
    Int,
    /// Floating point
    Float,
}

/// Parsed reply of a remote procedure.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Acknowledgement text
    Ack(String),
    /// Integer value
    Int(i64),
    /// Floating-point value
    Float(f64),
}

impl Reply {
    /// Integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric payload as `f64`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Reply::Float(v) => Some(*v),
            Reply::Int(v) => Some(*v as f64),
            Reply::Ack(_) => None,
        }
    }
}

/// One entry of the procedure table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcSpec {
    /// Wire name
    pub name: &'static str,
    /// Number of integer arguments
    pub arity: usize,
    /// Reply shape
    pub reply: ReplyKind,
}

const fn rpc(name: &'static str, arity: usize, reply: ReplyKind) -> RpcSpec {
    RpcSpec { name, arity, reply }
}

/// Procedures exposed by the slow-control server.
pub const RPC_TABLE: &[RpcSpec] = &[
    rpc("read_calib_dac", 1, ReplyKind::Int),
    rpc("set_calib_dac", 2, ReplyKind::Ack),
    rpc("read_adc", 1, ReplyKind::Int),
    rpc("read_bias_current", 1, ReplyKind::Float),
    rpc("read_led_voltage", 0, ReplyKind::Float),
    rpc("read_led_current", 0, ReplyKind::Float),
    rpc("read_gpio_direction", 0, ReplyKind::Int),
    rpc("set_gpio_direction", 1, ReplyKind::Ack),
    rpc("read_gpio_values", 0, ReplyKind::Int),
    rpc("set_gpio_values", 1, ReplyKind::Ack),
    rpc("set_gpio", 3, ReplyKind::Ack),
    rpc("reset_tdc", 0, ReplyKind::Ack),
];

/// Look up a procedure by wire name.
pub fn lookup(name: &str) -> Option<&'static RpcSpec> {
    RPC_TABLE.iter().find(|spec| spec.name == name)
}

/// Convert a raw bias-monitor ADC reading to volts.
///
/// 12-bit ADC over a 204 kOhm / 4 kOhm divider, followed by the 82:1 and
/// 200:4 stages of the bias board.
pub fn bias_adc_to_volts(adc: f64) -> f64 {
    adc / 4095.0 * 204000.0 / 4000.0 * (82.0 / 1.0) / (200.0 / 4.0)
}

/// Slow-control client.
#[derive(Debug)]
pub struct SlowControlClient {
    client: MessageClient,
}

impl SlowControlClient {
    /// Create an unconnected client.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            client: MessageClient::new(connector),
        }
    }

    /// Connect, initialize the board with the full configuration and run the
    /// GPIO bring-up sequence.
    #[instrument(skip(self, document), err)]
    pub fn connect(&mut self, address: &str, port: u16, document: ConfigTree) -> AppResult<()> {
        self.client.connect(address, port, document)?;
        self.client.require_ready("initialize")?;
        self.client.send_config()?;
        self.bring_up()?;
        info!("slow control initialized");
        Ok(())
    }

    /// Fixed GPIO initialization: direction mask, then bias enable, LED
    /// master enable, and both LED disable lines cleared.
    fn bring_up(&mut self) -> AppResult<()> {
        self.set_gpio_direction(gpio::BRING_UP_DIRECTION)?;
        self.set_gpio(gpio::BIAS_ENABLE, true)?;
        self.set_gpio(gpio::LED_MASTER_ENABLE, true)?;
        self.set_gpio(gpio::LED_DISABLE_1 | gpio::LED_DISABLE_2, false)?;
        Ok(())
    }

    /// Call a procedure from [`RPC_TABLE`].
    pub fn invoke(&mut self, name: &str, args: &[i64]) -> AppResult<Reply> {
        let spec = lookup(name)
            .ok_or_else(|| DaqError::InvalidCommand(format!("unknown procedure '{name}'")))?;
        if args.len() != spec.arity {
            return Err(DaqError::InvalidCommand(format!(
                "'{name}' takes {} argument(s), got {}",
                spec.arity,
                args.len()
            )));
        }

        let request = std::iter::once(name.to_owned())
            .chain(args.iter().map(i64::to_string))
            .collect::<Vec<_>>()
            .join(" ");
        let reply = self.client.send(&request)?;
        debug!(%request, %reply, "slow control call");
        parse_reply(spec.reply, &request, reply)
    }

    /// Calibration DAC setting of `channel`.
    pub fn read_calib_dac(&mut self, channel: u8) -> AppResult<u16> {
        let reply = self.invoke("read_calib_dac", &[channel.into()])?;
        int_reply(reply, "read_calib_dac")
    }

    /// Program the calibration DAC of `channel`.
    pub fn set_calib_dac(&mut self, channel: u8, value: u16) -> AppResult<()> {
        self.invoke("set_calib_dac", &[channel.into(), value.into()])
            .map(|_| ())
    }

    /// Raw reading of a monitoring ADC channel.
    pub fn read_adc(&mut self, channel: u8) -> AppResult<u16> {
        let reply = self.invoke("read_adc", &[channel.into()])?;
        int_reply(reply, "read_adc")
    }

    /// Bias current of `channel`.
    pub fn read_bias_current(&mut self, channel: u8) -> AppResult<f64> {
        let reply = self.invoke("read_bias_current", &[channel.into()])?;
        float_reply(reply, "read_bias_current")
    }

    /// LED supply voltage.
    pub fn read_led_voltage(&mut self) -> AppResult<f64> {
        let reply = self.invoke("read_led_voltage", &[])?;
        float_reply(reply, "read_led_voltage")
    }

    /// LED supply current.
    pub fn read_led_current(&mut self) -> AppResult<f64> {
        let reply = self.invoke("read_led_current", &[])?;
        float_reply(reply, "read_led_current")
    }

    /// GPIO direction mask (1 = output).
    pub fn read_gpio_direction(&mut self) -> AppResult<u32> {
        let reply = self.invoke("read_gpio_direction", &[])?;
        int_reply(reply, "read_gpio_direction")
    }

    /// Set the GPIO direction mask.
    pub fn set_gpio_direction(&mut self, mask: u32) -> AppResult<()> {
        self.invoke("set_gpio_direction", &[mask.into()]).map(|_| ())
    }

    /// GPIO line levels.
    pub fn read_gpio_values(&mut self) -> AppResult<u32> {
        let reply = self.invoke("read_gpio_values", &[])?;
        int_reply(reply, "read_gpio_values")
    }

    /// Write all GPIO line levels at once.
    pub fn set_gpio_values(&mut self, values: u32) -> AppResult<()> {
        self.invoke("set_gpio_values", &[values.into()]).map(|_| ())
    }

    /// Drive the lines in `mask` as outputs at `level`.
    pub fn set_gpio(&mut self, mask: u32, level: bool) -> AppResult<()> {
        self.invoke("set_gpio", &[mask.into(), gpio::OUTPUT, i64::from(level)])
            .map(|_| ())
    }

    /// Reset the on-board TDC.
    pub fn reset_tdc(&mut self) -> AppResult<()> {
        self.invoke("reset_tdc", &[]).map(|_| ())
    }

    /// Bias voltage of `channel` in volts, read from its monitoring ADC.
    pub fn bias_voltage(&mut self, channel: u8) -> AppResult<f64> {
        let adc_channel = if channel == 1 {
            BIAS_ADC_CHANNEL_1
        } else {
            BIAS_ADC_CHANNEL_OTHER
        };
        let adc = self.read_adc(adc_channel)?;
        Ok(bias_adc_to_volts(f64::from(adc)))
    }

    /// Push the working configuration; see [`MessageClient::configure`].
    pub fn configure(&mut self, fragment: Option<&ConfigTree>) -> AppResult<String> {
        self.client.configure(fragment)
    }

    /// Underlying message client.
    pub fn client(&self) -> &MessageClient {
        &self.client
    }

    /// Mutable underlying message client.
    pub fn client_mut(&mut self) -> &mut MessageClient {
        &mut self.client
    }
}

fn parse_reply(kind: ReplyKind, request: &str, reply: String) -> AppResult<Reply> {
    let text = reply.trim();
    let parsed = match kind {
        ReplyKind::Ack => return Ok(Reply::Ack(reply)),
        ReplyKind::Int => parse_int(text).map(Reply::Int),
        ReplyKind::Float => text.parse::<f64>().ok().map(Reply::Float),
    };
    parsed.ok_or_else(|| DaqError::InvalidReply {
        command: request.to_owned(),
        reply: reply.clone(),
    })
}

fn parse_int(text: &str) -> Option<i64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn int_reply<T: TryFrom<i64>>(reply: Reply, command: &str) -> AppResult<T> {
    reply
        .as_int()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| DaqError::InvalidReply {
            command: command.to_owned(),
            reply: format!("{reply:?}"),
        })
}

fn float_reply(reply: Reply, command: &str) -> AppResult<f64> {
    reply.as_float().ok_or_else(|| DaqError::InvalidReply {
        command: command.to_owned(),
        reply: format!("{reply:?}"),
    })
}

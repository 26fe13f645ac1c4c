use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio_modbus::prelude::*;
use tokio_modbus::server::Service;
use tokio_modbus::ExceptionCode;

use crate::config::NodeConfig;
use crate::shared_state::AppState;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VariableType {
    ExpectedPower,
    MeasuredPower,
    SoilingLoss,
    PanelVoltage,
    Temperature,
    Status,
}

/// Register address → (node id, variable, word index).
/// Word 0 is the high half of a float32, word 1 the low half; status is a
/// single raw u16 at word 0.
pub type RegisterMap = HashMap<u16, (u16, VariableType, u8)>;

/// Encode a raw f32 value into two u16 big-endian words (IEEE 754).
/// high = bits 31..16, low = bits 15..0
fn float_to_words(v: f32) -> (u16, u16) {
    let bits = v.to_bits();
    ((bits >> 16) as u16, (bits & 0xFFFF) as u16)
}

pub fn build_register_map(nodes: &[NodeConfig]) -> RegisterMap {
    let mut map = RegisterMap::new();
    for node in nodes {
        let m = &node.modbus_mapping;
        tracing::info!(
            node_id = node.id,
            "modbus map: expected@{} measured@{} loss@{} voltage@{} temp@{} status@{}",
            m.expected_power_address,
            m.measured_power_address,
            m.soiling_loss_address,
            m.panel_voltage_address,
            m.temperature_address,
            m.status_address
        );
        for (addr, vt) in [
            (m.expected_power_address, VariableType::ExpectedPower),
            (m.measured_power_address, VariableType::MeasuredPower),
            (m.soiling_loss_address, VariableType::SoilingLoss),
            (m.panel_voltage_address, VariableType::PanelVoltage),
            (m.temperature_address, VariableType::Temperature),
        ] {
            map.insert(addr, (node.id, vt, 0u8));
            map.insert(addr.wrapping_add(1), (node.id, vt, 1u8));
        }
        map.insert(m.status_address, (node.id, VariableType::Status, 0u8));
    }
    map
}

/// Value of one register; unmapped registers and nodes without data read 0.
fn resolve(state: &AppState, register_map: &RegisterMap, reg_addr: u16) -> u16 {
    let Some((node_id, var_type, word_idx)) = register_map.get(&reg_addr) else {
        return 0;
    };
    let Some(data) = state.get_status(*node_id) else {
        return 0;
    };

    let f = match var_type {
        VariableType::Status => return data.status_flags,
        VariableType::ExpectedPower => data.expected_power_w,
        VariableType::MeasuredPower => data.measured_power_w,
        // NaN marks "no daylight comparison".
        VariableType::SoilingLoss => data.soiling_loss.unwrap_or(f32::NAN),
        VariableType::PanelVoltage => data.panel_voltage_v,
        VariableType::Temperature => data.temperature_c,
    };
    let (high, low) = float_to_words(f);
    #[cfg(feature = "verbose_log")]
    tracing::debug!(
        node_id,
        ?var_type,
        "{:.4} -> IEEE754 hi=0x{:04X} lo=0x{:04X} (addr {})",
        f, high, low, reg_addr
    );
    if *word_idx == 0 { high } else { low }
}

struct MbService {
    state: AppState,
    register_map: RegisterMap,
}

impl Service for MbService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Exception>> + Send + Sync>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let state = self.state.clone();
        let register_map = self.register_map.clone();

        Box::pin(async move {
            let read = |addr: u16, cnt: u16| -> Vec<u16> {
                (0..cnt).map(|i| resolve(&state, &register_map, addr.wrapping_add(i))).collect()
            };
            match req {
                Request::ReadInputRegisters(addr, cnt) => Ok(Response::ReadInputRegisters(read(addr, cnt))),
                Request::ReadHoldingRegisters(addr, cnt) => Ok(Response::ReadHoldingRegisters(read(addr, cnt))),
                _ => Err(ExceptionCode::IllegalFunction),
            }
        })
    }
}

pub async fn run_server(addr: SocketAddr, state: AppState, register_map: RegisterMap) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Modbus TCP server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = tokio_modbus::server::tcp::Server::new(listener);

    let on_connected = move |socket, _addr| {
        let state = state.clone();
        let register_map = register_map.clone();
        async move { Ok::<_, std::io::Error>(Some((MbService { state, register_map }, socket))) }
    };

    server.serve(&on_connected, |err| { tracing::error!("Modbus server error: {:?}", err); }).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ModbusMapping};
    use crate::models::node::{status_bits, NodeReading};
    use chrono::Utc;

    fn node() -> NodeConfig {
        NodeConfig {
            id: 1,
            name: "roof".into(),
            calibration: None,
            modbus_mapping: ModbusMapping {
                expected_power_address: 100,
                measured_power_address: 102,
                soiling_loss_address: 104,
                panel_voltage_address: 106,
                temperature_address: 108,
                status_address: 110,
            },
        }
    }

    #[test]
    fn test_float_words() {
        assert_eq!(float_to_words(1.0), (0x3F80, 0x0000));
        assert_eq!(float_to_words(9.5), (0x4118, 0x0000));
    }

    #[test]
    fn test_register_map_layout() {
        let map = build_register_map(&[node()]);
        assert_eq!(map.len(), 11);
        assert_eq!(map.get(&100), Some(&(1, VariableType::ExpectedPower, 0)));
        assert_eq!(map.get(&101), Some(&(1, VariableType::ExpectedPower, 1)));
        assert_eq!(map.get(&110), Some(&(1, VariableType::Status, 0)));
    }

    #[test]
    fn test_resolve_reads_state() {
        let state = AppState::new();
        let mut cfg = Config::default();
        cfg.nodes.push(node());
        let map = build_register_map(&cfg.nodes);

        assert_eq!(resolve(&state, &map, 100), 0);
        assert_eq!(resolve(&state, &map, 999), 0);

        let reading = NodeReading {
            panel_voltage_v: 20.0,
            panel_current_a: 0.475,
            temperature_c: 25.0,
            ref_adc: None,
            battery_mv: None,
            pump_current_ma: None,
            pump_flow_pps: None,
            protocol_version: 2,
            timestamp: None,
        };
        state.ingest(&cfg, 1, &reading, Utc::now());

        let status = state.get_status(1).unwrap();
        let (hi, lo) = float_to_words(status.expected_power_w);
        assert_eq!(resolve(&state, &map, 100), hi);
        assert_eq!(resolve(&state, &map, 101), lo);
        assert_eq!(resolve(&state, &map, 106), 0x41A0);
        assert_eq!(resolve(&state, &map, 110) & status_bits::ONLINE, status_bits::ONLINE);
    }
}

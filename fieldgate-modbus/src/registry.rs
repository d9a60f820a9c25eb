//! Name-keyed factories for transports and wire protocols.
//!
//! A device names its transport (`interface_type`) and protocol
//! (`protocol_type`); the registry turns those names into a connector
//! carrying a fresh codec.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::tcp::DEFAULT_TRANSACTION_WRAP;
use crate::codec::{ModbusRtuCodec, ModbusTcpCodec, ProtocolCodec, TransactionSequence};
use crate::connector::serial::{RS485, SERIAL};
use crate::connector::tcp::{TCP_CLIENT, TCP_CLIENT_REUSE};
use crate::connector::{
    Connector, ConnectorOptions, SerialConnector, TcpConnector, open_serial_port,
};
use crate::error::{CodecError, RegistryError};
use crate::model::Device;

pub const MODBUS_TCP: &str = "modbus_tcp";
pub const MODBUS_RTU: &str = "modbus_rtu";

pub type ConnectorFactory = Arc<
    dyn Fn(Arc<Device>, Box<dyn ProtocolCodec>, &ConnectorOptions) -> Arc<dyn Connector>
        + Send
        + Sync,
>;

pub type CodecFactory =
    Arc<dyn Fn(&Device, &CodecOptions) -> Result<Box<dyn ProtocolCodec>, CodecError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CodecOptions {
    /// Upper bound of the Modbus TCP transaction id before it restarts at 1.
    pub transaction_wrap: u16,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            transaction_wrap: DEFAULT_TRANSACTION_WRAP,
        }
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    connectors: HashMap<String, ConnectorFactory>,
    codecs: HashMap<String, CodecFactory>,
    connector_options: ConnectorOptions,
    codec_options: CodecOptions,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("interfaces", &self.interfaces())
            .field("protocols", &self.protocols())
            .field("connector_options", &self.connector_options)
            .field("codec_options", &self.codec_options)
            .finish()
    }
}

impl Registry {
    /// Empty registry.
    pub fn new(connector_options: ConnectorOptions, codec_options: CodecOptions) -> Self {
        Self {
            connectors: HashMap::new(),
            codecs: HashMap::new(),
            connector_options,
            codec_options,
        }
    }

    /// Registry with the built-in TCP, serial, Modbus TCP and RTU entries.
    pub fn with_defaults(connector_options: ConnectorOptions, codec_options: CodecOptions) -> Self {
        let mut registry = Self::new(connector_options, codec_options);

        registry.register_connector(TCP_CLIENT, Arc::new(tcp_client));
        registry.register_connector(TCP_CLIENT_REUSE, Arc::new(tcp_client_reuse));
        registry.register_connector(SERIAL, serial_line(SERIAL));
        registry.register_connector(RS485, serial_line(RS485));

        registry.register_codec(MODBUS_TCP, Arc::new(modbus_tcp));
        registry.register_codec(MODBUS_RTU, Arc::new(modbus_rtu));
        registry
    }

    /// Register or replace a transport. Names are case-insensitive.
    pub fn register_connector(&mut self, name: &str, factory: ConnectorFactory) {
        self.connectors.insert(name.to_ascii_lowercase(), factory);
    }

    /// Register or replace a protocol. Names are case-insensitive.
    pub fn register_codec(&mut self, name: &str, factory: CodecFactory) {
        self.codecs.insert(name.to_ascii_lowercase(), factory);
    }

    pub fn interfaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn connector_options(&self) -> &ConnectorOptions {
        &self.connector_options
    }

    /// A fresh codec for the device's protocol.
    pub fn codec(&self, device: &Device) -> Result<Box<dyn ProtocolCodec>, RegistryError> {
        let factory = self
            .codecs
            .get(&device.protocol_type.to_ascii_lowercase())
            .ok_or_else(|| RegistryError::UnknownProtocol(device.protocol_type.clone()))?;
        Ok(factory(device, &self.codec_options)?)
    }

    /// A connector for the device's transport, carrying a fresh codec.
    pub fn connector(&self, device: Arc<Device>) -> Result<Arc<dyn Connector>, RegistryError> {
        Ok(self.link(device)?.0)
    }

    /// A connector plus a copy of the codec it carries, for the poll path.
    ///
    /// Both share one codec state, so requests built on either side never
    /// reuse each other's transaction ids.
    pub fn link(
        &self,
        device: Arc<Device>,
    ) -> Result<(Arc<dyn Connector>, Box<dyn ProtocolCodec>), RegistryError> {
        let factory = self
            .connectors
            .get(&device.interface_type.to_ascii_lowercase())
            .ok_or_else(|| RegistryError::UnknownInterface(device.interface_type.clone()))?;
        let codec = self.codec(&device)?;
        let poll_codec = codec.copy();
        Ok((factory(device, codec, &self.connector_options), poll_codec))
    }
}

fn tcp_client(
    device: Arc<Device>,
    codec: Box<dyn ProtocolCodec>,
    options: &ConnectorOptions,
) -> Arc<dyn Connector> {
    Arc::new(TcpConnector::new(device, codec, options))
}

fn tcp_client_reuse(
    device: Arc<Device>,
    codec: Box<dyn ProtocolCodec>,
    options: &ConnectorOptions,
) -> Arc<dyn Connector> {
    Arc::new(TcpConnector::with_port_reuse(device, codec, options))
}

fn serial_line(name: &'static str) -> ConnectorFactory {
    Arc::new(
        move |device: Arc<Device>,
              codec: Box<dyn ProtocolCodec>,
              options: &ConnectorOptions|
              -> Arc<dyn Connector> {
            Arc::new(SerialConnector::with_opener(
                device,
                codec,
                options,
                name,
                Arc::new(open_serial_port),
            ))
        },
    )
}

fn modbus_tcp(device: &Device, options: &CodecOptions) -> Result<Box<dyn ProtocolCodec>, CodecError> {
    let sequence = TransactionSequence::new(options.transaction_wrap);
    Ok(Box::new(ModbusTcpCodec::new(device.device_address, sequence)))
}

fn modbus_rtu(device: &Device, _: &CodecOptions) -> Result<Box<dyn ProtocolCodec>, CodecError> {
    Ok(Box::new(ModbusRtuCodec::new(device.device_address)?))
}

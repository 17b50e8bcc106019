/// Per-device UPnP root device description XML — the document SSDP's
/// `LOCATION` header points at and a control point fetches first.
use crate::virtual_device::VirtualDevice;

pub fn generate_device_description(device: &VirtualDevice, base_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion>
    <major>1</major>
    <minor>0</minor>
  </specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>{friendly_name}</friendlyName>
    <manufacturer>airbridge</manufacturer>
    <manufacturerURL>https://example.invalid/airbridge</manufacturerURL>
    <modelDescription>AirPlay-to-DLNA bridge renderer</modelDescription>
    <modelName>airbridge-dlna</modelName>
    <modelNumber>1.0</modelNumber>
    <serialNumber>{device_id}</serialNumber>
    <UDN>{uuid}</UDN>
    <presentationURL>{base_url}</presentationURL>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <SCPDURL>/device/{device_id}/AVTransport.xml</SCPDURL>
        <controlURL>/device/{device_id}/ctl/AVTransport</controlURL>
        <eventSubURL>/device/{device_id}/evt/AVTransport</eventSubURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:RenderingControl</serviceId>
        <SCPDURL>/device/{device_id}/RenderingControl.xml</SCPDURL>
        <controlURL>/device/{device_id}/ctl/RenderingControl</controlURL>
        <eventSubURL>/device/{device_id}/evt/RenderingControl</eventSubURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:ConnectionManager:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:ConnectionManager</serviceId>
        <SCPDURL>/device/{device_id}/ConnectionManager.xml</SCPDURL>
        <controlURL>/device/{device_id}/ctl/ConnectionManager</controlURL>
        <eventSubURL>/device/{device_id}/evt/ConnectionManager</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#,
        friendly_name = device.device_name,
        device_id = device.device_id,
        uuid = device.dlna_uuid,
        base_url = base_url,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::ConfigStore;
    use crate::event_bus::EventBus;
    use crate::output::LocalSpeaker;
    use crate::types::OutputConfig;
    use crate::virtual_device::DeviceKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn description_names_all_three_services() {
        let store = ConfigStore::load(std::env::temp_dir().join(format!(
            "airbridge-descr-test-{}.json",
            uuid::Uuid::new_v4()
        )))
        .await;
        let device = VirtualDevice::new(
            "dev1".to_string(),
            "Living Room".to_string(),
            DeviceKind::AirPlay,
            None,
            None,
            Box::new(LocalSpeaker::new(None)),
            OutputConfig::default(),
            std::env::temp_dir(),
            Arc::new(EventBus::default()),
            store,
        );

        let xml = generate_device_description(&device, "http://10.0.0.2:8200/device/dev1");
        assert!(xml.contains("AVTransport"));
        assert!(xml.contains("RenderingControl"));
        assert!(xml.contains("ConnectionManager"));
        assert!(xml.contains("Living Room"));
        assert!(xml.contains(&device.dlna_uuid));
    }
}

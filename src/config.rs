use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Command line surface. One immutable value of this struct is shared by
/// every service constructor.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "siplab",
    version,
    about = "SIP registrar/proxy with an integrated DHCP server for IP phone test labs"
)]
pub struct Config {
    /// Address to bind all services on
    #[arg(short = 'i', long = "ip", default_value_t = Ipv4Addr::LOCALHOST)]
    pub ip: Ipv4Addr,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Log file (default: stdout)
    #[arg(short = 'l', long = "log")]
    pub log_file: Option<PathBuf>,

    /// SIP UDP port
    #[arg(long = "sip-port", default_value_t = 5060)]
    pub sip_port: u16,

    /// Act as a redirect server instead of a proxy
    #[arg(long = "sip-redirect")]
    pub sip_redirect: bool,

    /// Default registration expiry in seconds
    #[arg(long = "sip-expires", default_value_t = 3600)]
    pub sip_expires: u32,

    /// Shared digest authentication password
    #[arg(long = "sip-password", default_value = "protected")]
    pub sip_password: String,

    /// Exposed/public IP used in the Record-Route and top Via headers
    /// (default: the bind address)
    #[arg(long = "sip-exposedip")]
    pub sip_exposed_ip: Option<String>,

    /// Exposed/public port used in the Record-Route and top Via headers
    /// (default: the SIP port)
    #[arg(long = "sip-exposedport")]
    pub sip_exposed_port: Option<u16>,

    /// Don't add the Record-Route header to forwarded requests
    #[arg(long = "sip-no-record-route")]
    pub sip_no_record_route: bool,

    /// Use "200 OK" as the local success reason instead of the stock
    /// "200 0K"
    #[arg(long = "sip-correct-ok")]
    pub sip_correct_ok: bool,

    /// SIP message transcript file (default: the general log sink)
    #[arg(long = "sip-log")]
    pub sip_log_file: Option<PathBuf>,

    /// Enable the DHCP server
    #[arg(long = "dhcp")]
    pub dhcp: bool,

    /// DHCP listen port
    #[arg(long = "dhcp-port", default_value_t = 67)]
    pub dhcp_port: u16,

    /// DHCP pool range start
    #[arg(long = "dhcp-begin")]
    pub dhcp_begin: Option<Ipv4Addr>,

    /// DHCP pool range end
    #[arg(long = "dhcp-end")]
    pub dhcp_end: Option<Ipv4Addr>,

    /// DHCP subnet mask (option 1)
    #[arg(long = "dhcp-subnetmask")]
    pub dhcp_subnet_mask: Option<Ipv4Addr>,

    /// DHCP gateway (option 3)
    #[arg(long = "dhcp-gateway")]
    pub dhcp_gateway: Option<Ipv4Addr>,

    /// DHCP DNS server (option 6)
    #[arg(long = "dhcp-dns")]
    pub dhcp_dns: Option<Ipv4Addr>,

    /// DHCP broadcast address replies are sent to
    #[arg(long = "dhcp-bcast")]
    pub dhcp_broadcast: Option<Ipv4Addr>,

    /// DHCP file server name (option 66)
    #[arg(long = "dhcp-fileserver")]
    pub dhcp_fileserver: Option<String>,

    /// DHCP boot file name (option 67)
    #[arg(long = "dhcp-filename")]
    pub dhcp_filename: Option<String>,

    /// DHCP lease store path
    #[arg(long = "dhcp-leasesfile", default_value = "dhcp_leases.dat")]
    pub dhcp_leases_file: PathBuf,
}

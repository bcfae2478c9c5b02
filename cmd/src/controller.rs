use clap::Parser;

#[derive(Debug, Clone, Parser)]
pub struct ControllerCmd {
    #[arg(long = "http-port", help = "HTTP server serving port")]
    pub http_port: Option<u32>,

    #[arg(short = 'f', long, help = "Config file path for the controller")]
    pub file: Option<String>,

    #[arg(
        short = 'n',
        long,
        help = "Namespace holding the load balancer ConfigMap"
    )]
    pub namespace: Option<String>,

    #[arg(long = "config-map", help = "Name of the load balancer ConfigMap")]
    pub config_map: Option<String>,

    #[arg(
        long = "load-balancer-class",
        help = "Handle services with this loadBalancerClass and enable the class controller"
    )]
    pub load_balancer_class: Option<String>,
}

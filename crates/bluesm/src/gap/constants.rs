// Address types as carried in SMP and HCI
pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;

// Top two bits of a random address
pub const RANDOM_ADDR_SUBTYPE_MASK: u8 = 0xC0;
pub const RANDOM_ADDR_RESOLVABLE: u8 = 0x40;
pub const RANDOM_ADDR_STATIC: u8 = 0xC0;

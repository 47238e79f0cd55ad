use crate::Error;

/// STUN message classes.
///
/// The class indicates whether this is a request, a success response,
/// or an error response.  Indications are carried as standalone
/// methods because they have no response counterpart.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Kind {
    Request,
    Response,
    Error,
}

/// STUN Methods Registry
///
/// [RFC5389]: https://datatracker.ietf.org/doc/html/rfc5389
/// [RFC5766]: https://datatracker.ietf.org/doc/html/rfc5766
///
/// A STUN method is a hex number in the range 0x000-0x0FF.  The
/// methods used by the ice core are:
///
/// 0x001: Binding
/// 0x003: Allocate
/// 0x004: Refresh
/// 0x006: Send (indication only)
/// 0x007: Data (indication only)
/// 0x008: CreatePermission
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Method {
    Binding(Kind),
    Allocate(Kind),
    CreatePermission(Kind),
    Refresh(Kind),
    SendIndication,
    DataIndication,
}

impl Method {
    /// whether the method is an error response.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Binding(Kind::Error)
                | Self::Allocate(Kind::Error)
                | Self::CreatePermission(Kind::Error)
                | Self::Refresh(Kind::Error)
        )
    }

    /// whether the method is a request.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::Binding(Kind::Request)
                | Self::Allocate(Kind::Request)
                | Self::CreatePermission(Kind::Request)
                | Self::Refresh(Kind::Request)
        )
    }

    /// whether the method is an indication.
    pub fn is_indication(&self) -> bool {
        matches!(self, Self::SendIndication | Self::DataIndication)
    }

    /// success response for a request method, None for indications.
    pub fn response(&self) -> Option<Method> {
        Some(match self {
            Self::Binding(_) => Self::Binding(Kind::Response),
            Self::Allocate(_) => Self::Allocate(Kind::Response),
            Self::CreatePermission(_) => Self::CreatePermission(Kind::Response),
            Self::Refresh(_) => Self::Refresh(Kind::Response),
            _ => return None,
        })
    }

    /// error response for a request method, None for indications.
    pub fn error(&self) -> Option<Method> {
        Some(match self {
            Self::Binding(_) => Self::Binding(Kind::Error),
            Self::Allocate(_) => Self::Allocate(Kind::Error),
            Self::CreatePermission(_) => Self::CreatePermission(Kind::Error),
            Self::Refresh(_) => Self::Refresh(Kind::Error),
            _ => return None,
        })
    }
}

impl TryFrom<u16> for Method {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::method::*;
    ///
    /// assert_eq!(Method::try_from(0x0001).unwrap(), Method::Binding(Kind::Request));
    /// assert_eq!(Method::try_from(0x0101).unwrap(), Method::Binding(Kind::Response));
    /// assert_eq!(Method::try_from(0x0111).unwrap(), Method::Binding(Kind::Error));
    /// assert_eq!(Method::try_from(0x0003).unwrap(), Method::Allocate(Kind::Request));
    /// assert_eq!(Method::try_from(0x0016).unwrap(), Method::SendIndication);
    /// assert_eq!(Method::try_from(0x0017).unwrap(), Method::DataIndication);
    /// assert!(Method::try_from(0x0002).is_err());
    /// ```
    fn try_from(value: u16) -> Result<Self, Error> {
        Ok(match value {
            0x0001 => Self::Binding(Kind::Request),
            0x0101 => Self::Binding(Kind::Response),
            0x0111 => Self::Binding(Kind::Error),
            0x0003 => Self::Allocate(Kind::Request),
            0x0103 => Self::Allocate(Kind::Response),
            0x0113 => Self::Allocate(Kind::Error),
            0x0004 => Self::Refresh(Kind::Request),
            0x0104 => Self::Refresh(Kind::Response),
            0x0114 => Self::Refresh(Kind::Error),
            0x0008 => Self::CreatePermission(Kind::Request),
            0x0108 => Self::CreatePermission(Kind::Response),
            0x0118 => Self::CreatePermission(Kind::Error),
            0x0016 => Self::SendIndication,
            0x0017 => Self::DataIndication,
            _ => return Err(Error::UnknownMethod),
        })
    }
}

impl From<Method> for u16 {
    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::method::*;
    ///
    /// assert_eq!(0x0001u16, Method::Binding(Kind::Request).into());
    /// assert_eq!(0x0101u16, Method::Binding(Kind::Response).into());
    /// assert_eq!(0x0111u16, Method::Binding(Kind::Error).into());
    /// assert_eq!(0x0016u16, Method::SendIndication.into());
    /// assert_eq!(0x0017u16, Method::DataIndication.into());
    /// ```
    fn from(val: Method) -> Self {
        match val {
            Method::Binding(Kind::Request) => 0x0001,
            Method::Binding(Kind::Response) => 0x0101,
            Method::Binding(Kind::Error) => 0x0111,
            Method::Allocate(Kind::Request) => 0x0003,
            Method::Allocate(Kind::Response) => 0x0103,
            Method::Allocate(Kind::Error) => 0x0113,
            Method::Refresh(Kind::Request) => 0x0004,
            Method::Refresh(Kind::Response) => 0x0104,
            Method::Refresh(Kind::Error) => 0x0114,
            Method::CreatePermission(Kind::Request) => 0x0008,
            Method::CreatePermission(Kind::Response) => 0x0108,
            Method::CreatePermission(Kind::Error) => 0x0118,
            Method::SendIndication => 0x0016,
            Method::DataIndication => 0x0017,
        }
    }
}
